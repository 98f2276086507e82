#[cfg(test)]
mod errors_tests {
    use crate::error::{ErrorReason, SendError};

    #[test]
    fn test_wire_shape() {
        let err = SendError::new(ErrorReason::MultipartMissingBoundary, 400);
        let json = err.to_json();
        assert_eq!(json["reason"], "MULTIPART_MISSING_BOUNDARY");
        assert_eq!(json["status"], 400);
        assert!(json["details"].is_null());
    }

    #[test]
    fn test_details_carried() {
        let err = SendError::bad_request(serde_json::json!({ "field": "username" }));
        assert_eq!(err.status, 400);
        assert_eq!(err.to_json()["details"]["field"], "username");
    }

    #[test]
    fn test_display_includes_reason_and_status() {
        let err = SendError::forbidden();
        assert_eq!(err.to_string(), "FORBIDDEN (403)");
    }

    #[test]
    fn test_io_not_found_becomes_404() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = SendError::from(io);
        assert_eq!(err.reason, ErrorReason::NotFound);
        assert_eq!(err.status, 404);
    }

    #[test]
    fn test_io_other_becomes_500() {
        let io = std::io::Error::other("broken");
        let err = SendError::from(io);
        assert_eq!(err.reason, ErrorReason::InternalServerError);
        assert_eq!(err.status, 500);
    }

    #[test]
    fn test_request_dropped_names_route() {
        let err = SendError::request_dropped("/wiki/(?<recipe>[^/]+)");
        assert_eq!(err.reason, ErrorReason::RequestDropped);
        assert_eq!(err.to_json()["details"]["route"], "/wiki/(?<recipe>[^/]+)");
    }

    #[test]
    fn test_json_parse_error_is_bad_request() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err = SendError::from(parse_err);
        assert_eq!(err.reason, ErrorReason::BadRequest);
        assert_eq!(err.status, 400);
    }
}
