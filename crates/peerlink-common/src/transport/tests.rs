//! Integration tests for the transport layer
//!
//! These tests run a real [`PeerServer`] on a loopback port and talk to it
//! through [`TcpTransport`].

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::protocol::{Dispatcher, JsonRpcRequest, Message, RequestId};
    use crate::transport::{JsonLineCodec, LineStream, PeerServer, TcpTransport};
    use serde_json::json;

    async fn start_echo_server() -> LineStream {
        let server = PeerServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.peer_address().unwrap();
        let dispatcher = Arc::new(Dispatcher::new().with_method("echo", Ok));
        tokio::spawn(server.run(dispatcher));

        TcpTransport::new(Duration::from_secs(2)).connect(&addr).await.unwrap()
    }

    async fn read_message(link: &mut LineStream) -> Message {
        let line = link.read_line().await.unwrap().expect("server closed the link");
        JsonLineCodec::decode(&line).unwrap()
    }

    #[tokio::test]
    async fn test_echo_over_tcp() {
        let mut link = start_echo_server().await;

        let request = JsonRpcRequest::new(7, "echo", json!("hi"));
        link.write_line(&JsonLineCodec::encode_request(&request).unwrap()).await.unwrap();

        match read_message(&mut link).await {
            Message::Response(res) => {
                assert_eq!(res.id, Some(RequestId::Number(7)));
                assert_eq!(res.into_result().unwrap(), json!("hi"));
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_line_gets_invalid_request_and_link_survives() {
        let mut link = start_echo_server().await;

        link.write_line(b"not-json\n").await.unwrap();
        match read_message(&mut link).await {
            Message::Response(res) => {
                assert_eq!(res.id, None);
                assert_eq!(res.error_object().unwrap().code, -32600);
            }
            other => panic!("expected response, got {:?}", other),
        }

        let request = JsonRpcRequest::new(8, "echo", json!([1]));
        link.write_line(&JsonLineCodec::encode_request(&request).unwrap()).await.unwrap();
        assert_eq!(read_message(&mut link).await.id(), Some(&RequestId::Number(8)));
    }

    #[tokio::test]
    async fn test_pipelined_requests_answered_in_order() {
        let mut link = start_echo_server().await;

        let mut batch = Vec::new();
        for id in 1..=3 {
            batch.extend(JsonLineCodec::encode_request(&JsonRpcRequest::new(id, "echo", json!(id))).unwrap());
        }
        link.write_line(&batch).await.unwrap();

        for id in 1..=3 {
            assert_eq!(read_message(&mut link).await.id(), Some(&RequestId::Number(id)));
        }
    }

    #[tokio::test]
    async fn test_stray_response_is_not_answered() {
        let mut link = start_echo_server().await;

        link.write_line(b"{\"jsonrpc\":\"2.0\",\"result\":1,\"id\":99}\n").await.unwrap();
        let request = JsonRpcRequest::new(1, "echo", json!("after"));
        link.write_line(&JsonLineCodec::encode_request(&request).unwrap()).await.unwrap();

        // the first thing back is the echo, not a reply to the stray response
        assert_eq!(read_message(&mut link).await.id(), Some(&RequestId::Number(1)));
    }
}
