#[cfg(test)]
mod static_files_tests {
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use hyper::Method;

    use crate::state::send::EngineBody;
    use crate::state::{test_state, test_state_with};
    use crate::static_files::SendFileOptions;

    async fn body_bytes(response: hyper::Response<EngineBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    fn fixture_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), vec![7u8; 1024]).unwrap();
        std::fs::write(dir.path().join("page.html"), "<h1>wiki</h1>").unwrap();
        std::fs::write(dir.path().join(".secret"), "hidden").unwrap();
        std::fs::create_dir(dir.path().join("folder")).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_serves_file_with_length_and_type() {
        let dir = fixture_dir();
        let mut state = test_state(Method::GET, "/static/page.html");
        state
            .send_file(SendFileOptions::new(dir.path(), "page.html"))
            .await
            .unwrap();

        let response = state.take_response().unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], "text/html");
        assert_eq!(response.headers()["content-length"], "13");
        assert_eq!(response.headers()["accept-ranges"], "bytes");
        assert_eq!(&body_bytes(response).await[..], b"<h1>wiki</h1>");
    }

    #[tokio::test]
    async fn test_head_has_length_but_no_body() {
        let dir = fixture_dir();
        let mut state = test_state(Method::HEAD, "/static/data.bin");
        state
            .send_file(SendFileOptions::new(dir.path(), "data.bin"))
            .await
            .unwrap();

        let response = state.take_response().unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-length"], "1024");
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_404() {
        let dir = fixture_dir();
        let mut state = test_state(Method::GET, "/static/nope.txt");
        state
            .send_file(SendFileOptions::new(dir.path(), "nope.txt"))
            .await
            .unwrap();
        assert_eq!(state.take_response().unwrap().status(), 404);
    }

    #[tokio::test]
    async fn test_extension_fallback() {
        let dir = fixture_dir();
        let mut state = test_state(Method::GET, "/static/page");
        state
            .send_file(SendFileOptions {
                extensions: vec!["html".to_string()],
                ..SendFileOptions::new(dir.path(), "page")
            })
            .await
            .unwrap();
        let response = state.take_response().unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(&body_bytes(response).await[..], b"<h1>wiki</h1>");
    }

    #[tokio::test]
    async fn test_traversal_refused() {
        let dir = fixture_dir();
        let mut state = test_state(Method::GET, "/static/x");
        state
            .send_file(SendFileOptions::new(dir.path(), "../data.bin"))
            .await
            .unwrap();
        assert_eq!(state.take_response().unwrap().status(), 404);
    }

    #[tokio::test]
    async fn test_dotfile_refused() {
        let dir = fixture_dir();
        let mut state = test_state(Method::GET, "/static/.secret");
        state
            .send_file(SendFileOptions::new(dir.path(), ".secret"))
            .await
            .unwrap();
        assert_eq!(state.take_response().unwrap().status(), 404);
    }

    #[tokio::test]
    async fn test_directory_is_404_with_reason() {
        let dir = fixture_dir();
        let mut state = test_state(Method::GET, "/static/folder");
        state
            .send_file(SendFileOptions::new(dir.path(), "folder"))
            .await
            .unwrap();

        let response = state.take_response().unwrap();
        assert_eq!(response.status(), 404);
        assert_eq!(
            response.headers()["x-reason"],
            "Directory listing not allowed"
        );
    }

    #[tokio::test]
    async fn test_range_served_as_206() {
        let dir = fixture_dir();
        let mut state = test_state_with(
            Method::GET,
            "/static/data.bin",
            &[("range", "bytes=0-99")],
            Bytes::new(),
        );
        state
            .send_file(SendFileOptions::new(dir.path(), "data.bin"))
            .await
            .unwrap();

        let response = state.take_response().unwrap();
        assert_eq!(response.status(), 206);
        assert_eq!(response.headers()["content-range"], "bytes 0-99/1024");
        assert_eq!(response.headers()["content-length"], "100");
        assert_eq!(body_bytes(response).await.len(), 100);
    }

    #[tokio::test]
    async fn test_suffix_range() {
        let dir = fixture_dir();
        let mut state = test_state_with(
            Method::GET,
            "/static/data.bin",
            &[("range", "bytes=-24")],
            Bytes::new(),
        );
        state
            .send_file(SendFileOptions::new(dir.path(), "data.bin"))
            .await
            .unwrap();

        let response = state.take_response().unwrap();
        assert_eq!(response.status(), 206);
        assert_eq!(response.headers()["content-range"], "bytes 1000-1023/1024");
        assert_eq!(body_bytes(response).await.len(), 24);
    }

    #[tokio::test]
    async fn test_range_out_of_bounds_is_416() {
        let dir = fixture_dir();
        let mut state = test_state_with(
            Method::GET,
            "/static/data.bin",
            &[("range", "bytes=4096-")],
            Bytes::new(),
        );
        state
            .send_file(SendFileOptions::new(dir.path(), "data.bin"))
            .await
            .unwrap();

        let response = state.take_response().unwrap();
        assert_eq!(response.status(), 416);
        assert_eq!(response.headers()["content-range"], "bytes */1024");
    }

    #[tokio::test]
    async fn test_if_none_match_gives_304() {
        let dir = fixture_dir();

        let mut first = test_state(Method::GET, "/static/data.bin");
        first
            .send_file(SendFileOptions::new(dir.path(), "data.bin"))
            .await
            .unwrap();
        let etag = first.take_response().unwrap().headers()["etag"]
            .to_str()
            .unwrap()
            .to_string();

        let mut second = test_state_with(
            Method::GET,
            "/static/data.bin",
            &[("if-none-match", etag.as_str())],
            Bytes::new(),
        );
        second
            .send_file(SendFileOptions::new(dir.path(), "data.bin"))
            .await
            .unwrap();

        let response = second.take_response().unwrap();
        assert_eq!(response.status(), 304);
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_cache_control_from_max_age() {
        let dir = fixture_dir();
        let mut state = test_state(Method::GET, "/static/data.bin");
        state
            .send_file(SendFileOptions {
                max_age: Some(86400),
                immutable: true,
                ..SendFileOptions::new(dir.path(), "data.bin")
            })
            .await
            .unwrap();

        let response = state.take_response().unwrap();
        assert_eq!(
            response.headers()["cache-control"],
            "public, max-age=86400, immutable"
        );
    }

    #[tokio::test]
    async fn test_not_found_hook_overrides_default() {
        use crate::state::RequestState;
        use crate::static_files::FileHookFuture;

        fn spa_fallback(state: &mut RequestState) -> FileHookFuture<'_> {
            Box::pin(async move { state.send_simple(200, "index shell").await })
        }

        let dir = fixture_dir();
        let mut state = test_state(Method::GET, "/static/missing.js");
        state
            .send_file(SendFileOptions {
                on_not_found: Some(Box::new(spa_fallback)),
                ..SendFileOptions::new(dir.path(), "missing.js")
            })
            .await
            .unwrap();

        let response = state.take_response().unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(&body_bytes(response).await[..], b"index shell");
    }

    #[tokio::test]
    async fn test_offset_and_length_window() {
        let dir = fixture_dir();
        let mut state = test_state(Method::GET, "/static/data.bin");
        state
            .send_file(SendFileOptions {
                offset: Some(512),
                length: Some(128),
                ..SendFileOptions::new(dir.path(), "data.bin")
            })
            .await
            .unwrap();

        let response = state.take_response().unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-length"], "128");
        assert_eq!(body_bytes(response).await.len(), 128);
    }
}
