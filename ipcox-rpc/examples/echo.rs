//! Very simple example in which a server hosted at the path `echo` has a method `echo` that
//! returns whatever params are sent to it, reached through a proxy over a newline-delimited byte
//! stream.
use std::sync::Arc;

use ipcox_rpc::{
    ChannelMultiplexer, Connection, ProxyProvider, Router, RpcServerHost, RpcServerRegistry, RpcServerWrap, SenderId,
};
use serde_json::{Value as JsonValue, json};
use tokio::io::duplex;
use tokio_util::codec::{Framed, LinesCodec};

#[tokio::main]
async fn main() {
    // Create a pair of connected pipes that will serve as the transport between the two ends
    let (client, server) = duplex(1024);

    // Create framed transports with a reasonable max size to avoid DoS vulns
    let client_conn = Connection::new(Framed::new(client, LinesCodec::new_with_max_length(1024 * 1024)));
    let server_conn = Connection::new(Framed::new(server, LinesCodec::new_with_max_length(1024 * 1024)));

    let mut router = Router::new_stateless();
    router.register_handler("echo", |params: JsonValue| async move { params });

    let registry = Arc::new(RpcServerRegistry::new());
    registry.register("echo", Arc::new(RpcServerWrap::new(router)));

    let _host = RpcServerHost::serve(
        SenderId::new("example"),
        ChannelMultiplexer::new(server_conn.clone()),
        registry,
    );
    let provider = ProxyProvider::new(ChannelMultiplexer::new(client_conn.clone()));
    server_conn.open().unwrap();
    client_conn.open().unwrap();

    let proxy = provider.get_proxy("echo").await.unwrap();

    let response: JsonValue = proxy.call("echo", ("Hello, world!",)).await.unwrap();
    assert_eq!(response, json!(["Hello, world!"]));

    let response: JsonValue = proxy.call("echo", json!({ "foo": "bar" })).await.unwrap();
    assert_eq!(response, json!([{ "foo": "bar" }]));

    let response: JsonValue = proxy.call("echo", [1, 2, 3]).await.unwrap();
    assert_eq!(response, json!([1, 2, 3]));

    // Shutdown the server end
    server_conn.close_and_wait("example finished").await;
    client_conn.closed().await;

    // No more requests should be accepted
    assert!(proxy.call::<_, JsonValue>("echo", ("Hello, world!",)).await.is_err());
}
