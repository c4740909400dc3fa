// The long-poll primitive: peek-after-cursor over a set of queues,
// parked on a first-to-complete race between a timer and every queue's
// wake channel.
use crate::dispatch::{Response, Switch};
use crate::message::{Entry, MessageId, MessageKind};
use crate::trace::{TraceEvent, TraceMessage};
use crate::{Result, SwitchError};
use futures::future::select_all;
use std::time::Duration;

fn seconds_to_ns(seconds: f64) -> u64 {
    let ns = seconds * 1e9;
    if ns >= u64::MAX as f64 { u64::MAX } else { ns as u64 }
}

impl Switch {
    /// Return every entry with index beyond `from` across `queues`,
    /// waiting up to `timeout` seconds for the first one to appear.
    ///
    /// An empty result after the full wait is a normal outcome. A queue
    /// that is missing at the start, or destroyed while we are parked,
    /// fails the whole transfer with the deletion signal.
    pub(crate) async fn transfer(
        &self,
        session: Option<&str>,
        from: Option<u64>,
        timeout: f64,
        queues: &[String],
    ) -> Result<Response> {
        let cursor = from.unwrap_or(0);
        let timeout = timeout.max(0.0);
        let deadline_ns = self.clock.now_ns().saturating_add(seconds_to_ns(timeout));
        let deadline = tokio::time::Instant::now()
            + Duration::try_from_secs_f64(timeout).unwrap_or(Duration::ZERO);

        let mut resolved = Vec::with_capacity(queues.len());
        for name in queues {
            match self.directory.find(name).await {
                Some(queue) => resolved.push(queue),
                // Not in the directory means deleted as far as a consumer
                // can tell; same error as a deletion mid-wait.
                None => return Err(SwitchError::QueueDeleted(name.clone())),
            }
        }
        // Diagnostic breadcrumb only; last writer wins and nothing clears it.
        for queue in &resolved {
            queue.set_transfer_deadline(deadline_ns);
        }

        loop {
            let mut batch: Vec<(MessageId, Entry)> = Vec::new();
            for queue in &resolved {
                batch.extend(queue.peek_after(cursor));
            }
            if !batch.is_empty() {
                return Ok(self.package(session, from, batch).await);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(Response::Transfer {
                    messages: Vec::new(),
                    next: from,
                });
            }
            if resolved.is_empty() {
                // Nothing to wait on; burn the budget and report empty.
                tokio::time::sleep_until(deadline).await;
                return Ok(Response::Transfer {
                    messages: Vec::new(),
                    next: from,
                });
            }

            let waits: Vec<_> = resolved
                .iter()
                .map(|queue| Box::pin(queue.wait(cursor)))
                .collect();
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Ok(Response::Transfer {
                        messages: Vec::new(),
                        next: from,
                    });
                }
                (woken, _, _) = select_all(waits) => {
                    // Losing waits are dropped here, detaching their wake
                    // subscriptions. A wake is only a hint: loop and re-peek.
                    woken?;
                }
            }
        }
    }

    /// Emit one trace event per delivered message and compute the cursor
    /// the caller should come back with.
    async fn package(
        &self,
        session: Option<&str>,
        from: Option<u64>,
        batch: Vec<(MessageId, Entry)>,
    ) -> Response {
        let now = self.clock.now_ns();
        let mut next = from;
        let mut messages = Vec::with_capacity(batch.len());
        for (id, entry) in batch {
            let processing_time = match &entry.message.kind {
                MessageKind::Response { correlates } => {
                    match self.directory.find(&correlates.queue).await {
                        Some(queue) => queue
                            .find(correlates)
                            .map(|request| now.saturating_sub(request.enqueued_at)),
                        None => None,
                    }
                }
                MessageKind::Request { .. } => None,
            };
            self.trace.append(TraceEvent {
                time: self.clock.wall_seconds(),
                input: None,
                output: session.map(str::to_string),
                queue: id.queue.clone(),
                message: TraceMessage::Message {
                    id: id.clone(),
                    message: entry.message.clone(),
                },
                processing_time,
            });
            next = Some(next.unwrap_or(0).max(id.index));
            messages.push((id, entry.message));
        }
        metrics::counter!("switch_transferred_total").increment(messages.len() as u64);
        Response::Transfer { messages, next }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionId;
    use crate::dispatch::Request;
    use crate::message::Message;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Instant;

    async fn logged_in(switch: &Switch, conn: ConnectionId, session: &str) {
        switch
            .dispatch(
                conn,
                Request::Login {
                    session: session.to_string(),
                },
            )
            .await
            .expect("login");
    }

    fn transfer(from: Option<u64>, timeout: f64, queues: &[&str]) -> Request {
        Request::Transfer {
            from,
            timeout,
            queues: queues.iter().map(|name| name.to_string()).collect(),
        }
    }

    fn batch(response: Response) -> (Vec<(MessageId, Message)>, Option<u64>) {
        match response {
            Response::Transfer { messages, next } => (messages, next),
            other => panic!("expected transfer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_queue_times_out_with_the_callers_cursor() {
        let switch = Switch::new("www");
        let conn = ConnectionId(1);
        logged_in(&switch, conn, "a").await;
        switch.directory.add("empty").await;

        let start = Instant::now();
        let response = switch
            .dispatch(conn, transfer(None, 0.2, &["empty"]))
            .await
            .expect("transfer");
        assert!(start.elapsed() >= Duration::from_millis(150));
        let (messages, next) = batch(response);
        assert!(messages.is_empty());
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn pending_messages_return_immediately_in_order() {
        let switch = Switch::new("www");
        let conn = ConnectionId(1);
        logged_in(&switch, conn, "b").await;
        switch.directory.add("svc").await;
        for payload in [&b"one"[..], b"two", b"three"] {
            switch
                .dispatch(
                    conn,
                    Request::Send {
                        queue: "svc".into(),
                        message: Message::request(Bytes::copy_from_slice(payload), "r"),
                    },
                )
                .await
                .expect("send");
        }

        let (messages, next) = batch(
            switch
                .dispatch(conn, transfer(None, 10.0, &["svc"]))
                .await
                .expect("transfer"),
        );
        let indices: Vec<u64> = messages.iter().map(|(id, _)| id.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(next, Some(3));
    }

    #[tokio::test]
    async fn cursor_excludes_already_seen_messages() {
        let switch = Switch::new("www");
        let conn = ConnectionId(1);
        logged_in(&switch, conn, "b").await;
        switch.directory.add("svc").await;
        for _ in 0..3 {
            switch
                .dispatch(
                    conn,
                    Request::Send {
                        queue: "svc".into(),
                        message: Message::request(Bytes::from_static(b"x"), "r"),
                    },
                )
                .await
                .expect("send");
        }

        let (messages, next) = batch(
            switch
                .dispatch(conn, transfer(Some(2), 0.0, &["svc"]))
                .await
                .expect("transfer"),
        );
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0.index, 3);
        assert_eq!(next, Some(3));
    }

    #[tokio::test]
    async fn repeating_a_cursor_is_observationally_identical() {
        let switch = Switch::new("www");
        let conn = ConnectionId(1);
        logged_in(&switch, conn, "b").await;
        switch.directory.add("svc").await;
        switch
            .dispatch(
                conn,
                Request::Send {
                    queue: "svc".into(),
                    message: Message::request(Bytes::from_static(b"x"), "r"),
                },
            )
            .await
            .expect("send");

        let (first, _) = batch(
            switch
                .dispatch(conn, transfer(None, 0.0, &["svc"]))
                .await
                .expect("transfer"),
        );
        let (second, _) = batch(
            switch
                .dispatch(conn, transfer(None, 0.0, &["svc"]))
                .await
                .expect("transfer"),
        );
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn acked_messages_never_come_back() {
        let switch = Switch::new("www");
        let conn = ConnectionId(1);
        logged_in(&switch, conn, "b").await;
        switch.directory.add("svc").await;
        switch
            .dispatch(
                conn,
                Request::Send {
                    queue: "svc".into(),
                    message: Message::request(Bytes::from_static(b"x"), "r"),
                },
            )
            .await
            .expect("send");
        switch
            .dispatch(
                conn,
                Request::Ack {
                    id: MessageId::new("svc", 1),
                },
            )
            .await
            .expect("ack");

        let (messages, next) = batch(
            switch
                .dispatch(conn, transfer(None, 0.0, &["svc"]))
                .await
                .expect("transfer"),
        );
        assert!(messages.is_empty());
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn a_send_wakes_a_parked_multi_queue_transfer() {
        let switch = Arc::new(Switch::new("www"));
        let consumer = ConnectionId(1);
        let producer = ConnectionId(2);
        logged_in(&switch, consumer, "b").await;
        logged_in(&switch, producer, "c").await;
        switch.directory.add("x").await;
        switch.directory.add("y").await;

        let waiting = {
            let switch = Arc::clone(&switch);
            tokio::spawn(async move {
                switch
                    .dispatch(consumer, transfer(None, 10.0, &["x", "y"]))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        switch
            .dispatch(
                producer,
                Request::Send {
                    queue: "y".into(),
                    message: Message::request(Bytes::from_static(b"hi"), "r"),
                },
            )
            .await
            .expect("send");

        let (messages, next) = batch(waiting.await.expect("join").expect("transfer"));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, MessageId::new("y", 1));
        assert_eq!(next, Some(1));
    }

    #[tokio::test]
    async fn destroy_fails_a_parked_transfer() {
        let switch = Arc::new(Switch::new("www"));
        let consumer = ConnectionId(1);
        let destroyer = ConnectionId(2);
        logged_in(&switch, consumer, "b").await;
        logged_in(&switch, destroyer, "c").await;
        switch.directory.add("z").await;

        let waiting = {
            let switch = Arc::clone(&switch);
            tokio::spawn(async move {
                switch.dispatch(consumer, transfer(None, 10.0, &["z"])).await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        switch
            .dispatch(destroyer, Request::Destroy { queue: "z".into() })
            .await
            .expect("destroy");

        let err = waiting.await.expect("join").expect_err("queue deleted");
        assert!(matches!(err, SwitchError::QueueDeleted(name) if name == "z"));
    }

    #[tokio::test]
    async fn transfer_on_a_missing_queue_fails_up_front() {
        let switch = Switch::new("www");
        let conn = ConnectionId(1);
        logged_in(&switch, conn, "b").await;
        let err = switch
            .dispatch(conn, transfer(None, 1.0, &["never-created"]))
            .await
            .expect_err("missing queue");
        assert!(matches!(err, SwitchError::QueueDeleted(_)));
    }

    #[tokio::test]
    async fn responses_carry_processing_time_while_the_request_is_findable() {
        let switch = Switch::new("www");
        let requester = ConnectionId(1);
        let responder = ConnectionId(2);
        logged_in(&switch, requester, "a").await;
        logged_in(&switch, responder, "b").await;
        switch.directory.add("svc").await;
        switch.directory.add("a-reply").await;

        switch
            .dispatch(
                requester,
                Request::Send {
                    queue: "svc".into(),
                    message: Message::request(Bytes::from_static(b"ping"), "a-reply"),
                },
            )
            .await
            .expect("send request");
        tokio::time::sleep(Duration::from_millis(20)).await;
        switch
            .dispatch(
                responder,
                Request::Send {
                    queue: "a-reply".into(),
                    message: Message::response(Bytes::from_static(b"pong"), MessageId::new("svc", 1)),
                },
            )
            .await
            .expect("send response");

        let (messages, _) = batch(
            switch
                .dispatch(requester, transfer(None, 1.0, &["a-reply"]))
                .await
                .expect("transfer"),
        );
        assert_eq!(messages.len(), 1);

        // The dequeue event for the response carries the enqueue-to-reply gap.
        let events = switch.trace.get(0, 0.0).await;
        let dequeue = events
            .iter()
            .find(|item| item.event.output.is_some())
            .expect("dequeue event");
        let elapsed = dequeue.event.processing_time.expect("processing time");
        assert!(elapsed >= Duration::from_millis(15).as_nanos() as u64);
    }

    #[tokio::test]
    async fn responses_without_a_findable_request_have_no_processing_time() {
        let switch = Switch::new("www");
        let conn = ConnectionId(1);
        logged_in(&switch, conn, "a").await;
        switch.directory.add("a-reply").await;
        // Correlates to a queue that was never created.
        switch
            .dispatch(
                conn,
                Request::Send {
                    queue: "a-reply".into(),
                    message: Message::response(Bytes::from_static(b"pong"), MessageId::new("gone", 9)),
                },
            )
            .await
            .expect("send");

        batch(
            switch
                .dispatch(conn, transfer(None, 0.0, &["a-reply"]))
                .await
                .expect("transfer"),
        );
        let events = switch.trace.get(0, 0.0).await;
        let dequeue = events
            .iter()
            .find(|item| item.event.output.is_some())
            .expect("dequeue event");
        assert_eq!(dequeue.event.processing_time, None);
    }

    #[tokio::test]
    async fn transfer_stamps_the_expected_deadline_for_diagnostics() {
        let switch = Switch::new("www");
        let conn = ConnectionId(1);
        logged_in(&switch, conn, "a").await;
        switch.directory.add("watched").await;
        switch
            .dispatch(conn, transfer(None, 0.0, &["watched"]))
            .await
            .expect("transfer");

        let queue = switch.directory.find("watched").await.expect("queue");
        assert!(queue.transfer_deadline().is_some());
    }
}
