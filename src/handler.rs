//! The pluggable request handler invoked by workers.

/// Turns one request's bytes into a response string.
///
/// Invoked once per accepted connection, synchronously, on the worker's
/// thread. Implementations must not assume any ordering relative to other
/// connections and should avoid panicking; a panic unwinds the worker
/// thread that ran it.
pub trait Handler: Send + Sync {
    fn handle(&self, request: &[u8]) -> String;
}

impl<F> Handler for F
where
    F: Fn(&[u8]) -> String + Send + Sync,
{
    fn handle(&self, request: &[u8]) -> String {
        self(request)
    }
}

/// Default handler wired by the binary: answers `healthcheck` probes with an
/// empty response and echoes everything else back.
pub fn echo_with_healthcheck(request: &[u8]) -> String {
    if request.starts_with(b"healthcheck") {
        return String::new();
    }
    String::from_utf8_lossy(request).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_healthcheck_gets_empty_response() {
        assert_eq!(echo_with_healthcheck(b"healthcheck"), "");
        assert_eq!(echo_with_healthcheck(b"healthcheck please"), "");
    }

    #[test]
    fn test_other_requests_echo_back() {
        assert_eq!(echo_with_healthcheck(b"ping"), "ping");
    }

    #[test]
    fn test_closures_implement_handler() {
        let uppercase = |request: &[u8]| String::from_utf8_lossy(request).to_uppercase();
        let handler: &dyn Handler = &uppercase;
        assert_eq!(handler.handle(b"ping"), "PING");
    }
}
