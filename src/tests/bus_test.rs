#[cfg(test)]
mod bus_tests {
    use std::sync::{Arc, Mutex};

    use crate::bus::{events, EventBus, EventHandler};
    use crate::error::SendError;

    fn recording_handler(log: Arc<Mutex<Vec<String>>>, tag: &'static str) -> EventHandler {
        Arc::new(move |_payload| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push(tag.to_string());
                Ok(())
            })
        })
    }

    fn failing_handler(message: &'static str) -> EventHandler {
        Arc::new(move |_payload| {
            Box::pin(async move { Err(SendError::internal(message)) })
        })
    }

    #[tokio::test]
    async fn test_handlers_run_serially_in_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("mws.save", recording_handler(Arc::clone(&log), "first"));
        bus.on("mws.save", recording_handler(Arc::clone(&log), "second"));

        bus.emit_async("mws.save", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_off_removes_handler() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let subscription = bus.on("mws.save", recording_handler(Arc::clone(&log), "gone"));
        bus.off(&subscription);

        bus.emit_async("mws.save", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failures_aggregate_without_aborting_others() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("mws.sync", failing_handler("first failure"));
        bus.on("mws.sync", recording_handler(Arc::clone(&log), "survivor"));
        bus.on("mws.sync", failing_handler("second failure"));

        let err = bus
            .emit_async("mws.sync", serde_json::Value::Null)
            .await
            .unwrap_err();
        // The handler between the failures still ran.
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
        let details = err.details.unwrap();
        assert_eq!(details.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_emit_to_unknown_event_is_noop() {
        let bus = EventBus::new();
        bus.emit_async("mws.nothing", serde_json::Value::Null)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_exit_wakes_subscribers() {
        let bus = Arc::new(EventBus::new());
        let waiter = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                bus.wait_exit().await;
                true
            })
        };
        // Give the waiter a chance to subscribe before the emit.
        tokio::task::yield_now().await;
        bus.emit_async(events::EXIT, serde_json::Value::Null)
            .await
            .unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_payload_reaches_handler() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(serde_json::Value::Null));
        let seen_clone = Arc::clone(&seen);
        let handler: EventHandler = Arc::new(move |payload| {
            let seen = Arc::clone(&seen_clone);
            Box::pin(async move {
                *seen.lock().unwrap() = payload;
                Ok(())
            })
        });
        bus.on("mws.save", handler);

        bus.emit_async("mws.save", serde_json::json!({ "bag": "docs" }))
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap()["bag"], "docs");
    }
}
