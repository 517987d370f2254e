//! HTTP/1.1 protocol primitives shared by the service core.
//!
//! This module provides [`Method`], [`StatusCode`], [`Headers`], the
//! file-extension → MIME table in [`content_type`], and the parameter
//! decoding used for query strings and form bodies in [`params`].

use std::fmt;
use std::str::FromStr;

pub mod content_type;
pub mod headers;
pub mod params;

pub use headers::Headers;

macro_rules! status_codes {
    ($( $(#[$doc:meta])* $name:ident = $code:literal, $reason:literal; )+) => {
        /// A response status code.
        ///
        /// # Examples
        ///
        /// ```
        /// use slib_http::http::StatusCode;
        ///
        /// let status = StatusCode::NotFound;
        /// assert_eq!(status.as_u16(), 404);
        /// assert_eq!(status.canonical_reason(), "Not Found");
        /// assert_eq!(StatusCode::from_u16(404), Some(status));
        /// ```
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum StatusCode {
            $( $(#[$doc])* $name = $code, )+
        }

        impl StatusCode {
            /// Looks up a known status code.
            pub fn from_u16(code: u16) -> Option<Self> {
                match code {
                    $( $code => Some(Self::$name), )+
                    _ => None,
                }
            }

            /// Reason phrase written on the status line.
            pub fn canonical_reason(self) -> &'static str {
                match self {
                    $( Self::$name => $reason, )+
                }
            }
        }
    };
}

status_codes! {
    Ok = 200, "OK";
    Created = 201, "Created";
    Accepted = 202, "Accepted";
    NoContent = 204, "No Content";
    PartialContent = 206, "Partial Content";
    MovedPermanently = 301, "Moved Permanently";
    Found = 302, "Found";
    SeeOther = 303, "See Other";
    NotModified = 304, "Not Modified";
    TemporaryRedirect = 307, "Temporary Redirect";
    BadRequest = 400, "Bad Request";
    Unauthorized = 401, "Unauthorized";
    Forbidden = 403, "Forbidden";
    NotFound = 404, "Not Found";
    MethodNotAllowed = 405, "Method Not Allowed";
    RequestTimeout = 408, "Request Timeout";
    /// Answered by processors; the service itself rejects oversized bodies with `400`.
    PayloadTooLarge = 413, "Payload Too Large";
    InternalServerError = 500, "Internal Server Error";
    NotImplemented = 501, "Not Implemented";
    ServiceUnavailable = 503, "Service Unavailable";
}

impl StatusCode {
    /// Numeric code, e.g. `404`.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Formats as it appears on the status line, e.g. `404 Not Found`.
impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

/// A request method.
///
/// Tokens are matched case-insensitively; anything unrecognised is kept,
/// upper-cased, in [`Method::Custom`].
///
/// ```
/// use slib_http::http::Method;
///
/// let method: Method = "post".parse().unwrap();
/// assert_eq!(method, Method::Post);
/// assert_eq!(method.to_string(), "POST");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
    Trace,
    /// Tunnel requests. Unless a processor takes one over while preprocessing,
    /// the service refuses it and closes the connection.
    Connect,
    Custom(String),
}

impl Method {
    const KNOWN: [Method; 9] = [
        Method::Get,
        Method::Head,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Options,
        Method::Patch,
        Method::Trace,
        Method::Connect,
    ];

    /// The upper-case method token.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
            Self::Custom(token) => token,
        }
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let known = Self::KNOWN
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(token));
        Ok(known.unwrap_or_else(|| Self::Custom(token.to_ascii_uppercase())))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
