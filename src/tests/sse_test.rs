#[cfg(test)]
mod sse_tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use http_body_util::BodyExt;
    use hyper::Method;

    use crate::state::test_state;

    #[tokio::test]
    async fn test_three_events_arrive_in_order_then_close() {
        let mut state = test_state(Method::GET, "/events");
        let (mut sse, _ended) = state.send_sse(None).unwrap();

        let response = state.take_response().unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        assert_eq!(response.headers()["cache-control"], "no-cache, max-age=0");
        assert_eq!(response.headers()["content-encoding"], "identity");
        assert_eq!(response.headers()["x-accel-buffering"], "no");

        let reader = tokio::spawn(async move {
            response
                .into_body()
                .collect()
                .await
                .unwrap()
                .to_bytes()
        });

        for n in 1..=3 {
            sse.emit_event("tick", &serde_json::json!({ "n": n }), Some(&n.to_string()))
                .await
                .unwrap();
        }
        sse.close();

        let body = reader.await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let frames: Vec<&str> = text
            .split("\n\n")
            .filter(|frame| frame.contains("data:"))
            .collect();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].contains("event: tick"));
        assert!(frames[0].contains("id: 1"));
        assert!(frames[0].contains(r#"data: {"n":1}"#));
        assert!(frames[2].contains(r#"data: {"n":3}"#));
    }

    #[tokio::test]
    async fn test_retry_appended_to_every_event() {
        let mut state = test_state(Method::GET, "/events");
        let (mut sse, _ended) = state.send_sse(Some(2500)).unwrap();
        let response = state.take_response().unwrap();

        let reader = tokio::spawn(async move {
            response.into_body().collect().await.unwrap().to_bytes()
        });

        sse.emit_event("tick", &1, None).await.unwrap();
        sse.emit_event("tock", &2, None).await.unwrap();
        sse.close();

        let text = String::from_utf8(reader.await.unwrap().to_vec()).unwrap();
        assert_eq!(text.matches("retry: 2500").count(), 2);
    }

    #[tokio::test]
    async fn test_newlines_rejected_in_fields() {
        let mut state = test_state(Method::GET, "/events");
        let (mut sse, _ended) = state.send_sse(None).unwrap();

        assert!(sse.emit_event("bad\nname", &1, None).await.is_err());
        assert!(sse.emit_event("tick", &1, Some("bad\rid")).await.is_err());
        assert!(sse.emit_comment("multi\nline").await.is_err());
        sse.close();
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let mut state = test_state(Method::GET, "/events");
        let (mut sse, _ended) = state.send_sse(None).unwrap();
        sse.close();
        assert!(sse.is_closed());
        assert!(sse.emit_event("tick", &1, None).await.is_err());
        assert!(sse.emit_comment("late").await.is_err());
    }

    #[tokio::test]
    async fn test_on_close_fires_once() {
        let mut state = test_state(Method::GET, "/events");
        let (sse, _ended) = state.send_sse(None).unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        sse.on_close(move || {
            fired_clone.store(true, Ordering::SeqCst);
        });

        sse.close();
        sse.close();
        assert!(fired.load(Ordering::SeqCst));

        // Registered after close: fires immediately.
        let late = Arc::new(AtomicBool::new(false));
        let late_clone = Arc::clone(&late);
        sse.on_close(move || {
            late_clone.store(true, Ordering::SeqCst);
        });
        assert!(late.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_comment_frame_format() {
        let mut state = test_state(Method::GET, "/events");
        let (mut sse, _ended) = state.send_sse(None).unwrap();
        let response = state.take_response().unwrap();
        let reader = tokio::spawn(async move {
            response.into_body().collect().await.unwrap().to_bytes()
        });

        sse.emit_comment("keep-alive").await.unwrap();
        sse.close();

        let text = String::from_utf8(reader.await.unwrap().to_vec()).unwrap();
        assert!(text.contains(": keep-alive\n\n"));
    }
}
