use std::error::Error as StdError;
use std::fmt;
use std::future::Future;

use bridgewire_frame::{header_value, is_websocket_upgrade, RequestHead};

use crate::body::RequestBody;
use crate::sink::ResponseSink;

/// Error returned by application handlers.
///
/// Any `std::error::Error + Send + Sync` converts into it, so handlers can
/// use `?` on their own errors.
pub struct HandlerError(Box<dyn StdError + Send + Sync>);

impl HandlerError {
    pub fn message(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self(message.into())
    }

    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync> {
        self.0
    }
}

impl<E> From<E> for HandlerError
where
    E: StdError + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self(Box::new(err))
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

/// A request handed to the application.
#[derive(Debug)]
pub struct BridgeRequest {
    pub head: RequestHead,
    pub body: RequestBody,
}

impl BridgeRequest {
    pub fn new(head: RequestHead, body: RequestBody) -> Self {
        Self { head, body }
    }

    pub fn method(&self) -> &str {
        &self.head.method
    }

    pub fn path(&self) -> &str {
        &self.head.path
    }

    pub fn query(&self) -> &str {
        &self.head.query
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.head.headers, name)
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.head.headers
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        is_websocket_upgrade(&self.head.headers)
    }

    pub fn into_parts(self) -> (RequestHead, RequestBody) {
        (self.head, self.body)
    }
}

/// Application side of an exchange.
///
/// The handler reads the request body at its own pace and answers through
/// the [`ResponseSink`]: `start` once status and headers are known, any
/// number of `write`s, then `finish`. It may instead `detach` into a raw
/// tunnel. Returning an error before `start` produces an error response;
/// after `start` it aborts the connection.
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        request: BridgeRequest,
        response: ResponseSink,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

impl<F, Fut> Handler for F
where
    F: Fn(BridgeRequest, ResponseSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn handle(
        &self,
        request: BridgeRequest,
        response: ResponseSink,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send {
        self(request, response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn fails() -> Result<(), HandlerError> {
            Err::<(), _>(std::io::Error::other("disk gone"))?;
            Ok(())
        }
        assert_eq!(fails().unwrap_err().to_string(), "disk gone");
    }

    #[test]
    fn request_accessors_read_the_head() {
        let head = RequestHead::new("GET", "/chat")
            .with_header("Connection", "keep-alive, Upgrade")
            .with_header("upgrade", "websocket");
        let request = BridgeRequest::new(head, RequestBody::empty());
        assert_eq!(request.method(), "GET");
        assert_eq!(request.path(), "/chat");
        assert_eq!(request.query(), "");
        assert_eq!(request.header("UPGRADE"), Some("websocket"));
        assert!(request.is_websocket_upgrade());
    }
}
