use std::fmt;
use std::io::Read;
use std::path::PathBuf;

use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;

use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    /// Local file sent as the `file` part of a multipart body.
    pub upload: Option<PathBuf>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            upload: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn with_upload(mut self, path: impl Into<PathBuf>) -> Self {
        self.upload = Some(path.into());
        self
    }
}

/// Status line plus a body that is read lazily, chunk by chunk.
pub struct Response {
    pub status: u16,
    pub content_length: Option<u64>,
    body: Box<dyn Read + Send>,
}

impl Response {
    pub fn new(status: u16, content_length: Option<u64>, body: Box<dyn Read + Send>) -> Self {
        Self {
            status,
            content_length,
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_auth_failure(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    pub fn body_mut(&mut self) -> &mut (dyn Read + Send) {
        self.body.as_mut()
    }

    pub fn text(mut self) -> std::io::Result<String> {
        let mut bytes = Vec::new();
        self.body.read_to_end(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// The HTTP collaborator used by the client and the downloader.
///
/// Implementations return `Err(ArchiveError::Communication)` only when no
/// response was received; HTTP error statuses come back as a [`Response`].
pub trait Transport: Send + Sync {
    fn execute(&self, request: &Request) -> Result<Response>;
}

/// Blocking `reqwest` transport with basic authentication on every request.
pub struct HttpTransport {
    client: Client,
    username: String,
    password: String,
}

impl HttpTransport {
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| {
                ArchiveError::Configuration(format!("Could not initialize HTTP client: {err}"))
            })?;
        Ok(Self {
            client,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }
}

impl Transport for HttpTransport {
    fn execute(&self, request: &Request) -> Result<Response> {
        let url = request.url.as_str();
        log::debug!("{} {url}", request.method);

        let mut builder = match request.method {
            Method::Get => self.client.get(url),
            Method::Put => self.client.put(url),
            Method::Post => self.client.post(url),
            Method::Delete => self.client.delete(url),
        };
        builder = builder.basic_auth(&self.username, Some(&self.password));

        if let Some(path) = request.upload.as_ref() {
            let part = Part::file(path)
                .map_err(|err| ArchiveError::local_io(path, err))?
                .mime_str("application/octet-stream")
                .map_err(|err| ArchiveError::communication(url, err))?;
            builder = builder.multipart(Form::new().part("file", part));
        }

        let response = builder
            .send()
            .map_err(|err| ArchiveError::communication(url, err))?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        Ok(Response::new(status, content_length, Box::new(response)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport double for unit tests.

    use std::collections::VecDeque;
    use std::io::{self, Cursor, ErrorKind};
    use std::sync::Mutex;

    use super::*;

    #[derive(Clone)]
    pub(crate) enum Reply {
        Body {
            status: u16,
            body: Vec<u8>,
            content_length: Option<u64>,
        },
        /// 200 whose body drops the connection after the given bytes.
        Reset(Vec<u8>),
        Unreachable(String),
    }

    impl Reply {
        pub(crate) fn json(body: &str) -> Self {
            Reply::Body {
                status: 200,
                body: body.as_bytes().to_vec(),
                content_length: Some(body.len() as u64),
            }
        }

        pub(crate) fn status(status: u16, body: &str) -> Self {
            Reply::Body {
                status,
                body: body.as_bytes().to_vec(),
                content_length: Some(body.len() as u64),
            }
        }

        pub(crate) fn bytes(body: Vec<u8>, content_length: Option<u64>) -> Self {
            Reply::Body {
                status: 200,
                body,
                content_length,
            }
        }
    }

    struct Route {
        needle: String,
        replies: VecDeque<Reply>,
    }

    /// Answers requests whose URL contains a registered needle. Each route
    /// plays its replies in order and repeats the last one.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        routes: Mutex<Vec<Route>>,
        requests: Mutex<Vec<Request>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn route(self, needle: &str, reply: Reply) -> Self {
            {
                let mut routes = self.routes.lock().unwrap();
                match routes.iter_mut().find(|route| route.needle == needle) {
                    Some(route) => route.replies.push_back(reply),
                    None => routes.push(Route {
                        needle: needle.to_string(),
                        replies: VecDeque::from([reply]),
                    }),
                }
            }
            self
        }

        pub(crate) fn requests(&self) -> Vec<Request> {
            self.requests.lock().unwrap().clone()
        }

        pub(crate) fn urls(&self) -> Vec<String> {
            self.requests().into_iter().map(|request| request.url).collect()
        }
    }

    struct ResetAfter(Cursor<Vec<u8>>);

    impl Read for ResetAfter {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.read(buf)? {
                0 => Err(io::Error::new(ErrorKind::ConnectionReset, "connection reset")),
                read => Ok(read),
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn execute(&self, request: &Request) -> Result<Response> {
            self.requests.lock().unwrap().push(request.clone());

            let mut routes = self.routes.lock().unwrap();
            let Some(route) = routes
                .iter_mut()
                .find(|route| request.url.contains(&route.needle))
            else {
                return Ok(Response::new(404, Some(0), Box::new(Cursor::new(Vec::new()))));
            };

            let reply = if route.replies.len() > 1 {
                route.replies.pop_front()
            } else {
                route.replies.front().cloned()
            };

            match reply {
                Some(Reply::Body {
                    status,
                    body,
                    content_length,
                }) => Ok(Response::new(
                    status,
                    content_length,
                    Box::new(Cursor::new(body)),
                )),
                Some(Reply::Reset(body)) => Ok(Response::new(
                    200,
                    None,
                    Box::new(ResetAfter(Cursor::new(body))),
                )),
                Some(Reply::Unreachable(message)) => {
                    Err(ArchiveError::communication(&request.url, message))
                }
                None => Ok(Response::new(404, Some(0), Box::new(Cursor::new(Vec::new())))),
            }
        }
    }
}
