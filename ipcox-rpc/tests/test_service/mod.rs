use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::lock::Mutex;
use ipcox_rpc::{
    CancellationToken, ErrorDetails, Json, JsonValue, Params, Router, RpcServerWrap, Sender, State,
};
use serde::Deserialize;

/// Event fired whenever the counter changes.
pub const COUNTER_CHANGED: &str = "onDidChangeCounter";

/// A test service built on the RPC crate, used to exercise a proxy end to end.
///
/// Every method except `sleep` completes without suspending, so all of them except `sleep` are
/// also reachable through the synchronous path.
#[derive(Debug, Default)]
pub struct TestState {
    counter: i64,
    values: HashMap<String, JsonValue>,
}

pub type SharedState = Arc<Mutex<TestState>>;

pub fn test_service_router() -> Router<SharedState> {
    let mut router = Router::new_with_state(Arc::new(Mutex::new(TestState::default())));

    router.register_handler("echo", echo);
    router.register_handler("add", add);
    router.register_handler("increment_counter", increment_counter);
    router.register_handler("$get_counter", get_counter);
    router.register_handler("get_value", get_value);
    router.register_handler("set_value", set_value);
    router.register_handler("whoami", whoami);
    router.register_handler("sleep", sleep);
    router.register_handler("fail_with_error", fail_with_error);
    router.register_handler("fail_with_panic", fail_with_panic);
    router.register_event(COUNTER_CHANGED);

    router
}

pub fn test_service_server() -> RpcServerWrap<SharedState> {
    RpcServerWrap::new(test_service_router())
}

async fn echo(params: JsonValue) -> JsonValue {
    params
}

async fn add(Params((a, b)): Params<(i64, i64)>) -> Json<i64> {
    Json(a + b)
}

async fn increment_counter(State(state): State<SharedState>) -> Json<i64> {
    let mut state = state.lock().await;
    state.counter += 1;
    Json(state.counter)
}

async fn get_counter(State(state): State<SharedState>) -> Json<i64> {
    let state = state.lock().await;
    Json(state.counter)
}

#[derive(Deserialize)]
struct SetValueParams {
    key: String,
    value: JsonValue,
}

async fn set_value(
    State(state): State<SharedState>,
    Params(SetValueParams { key, value }): Params<SetValueParams>,
) {
    let mut state = state.lock().await;
    state.values.insert(key, value);
}

async fn get_value(State(state): State<SharedState>, Params((key,)): Params<(String,)>) -> JsonValue {
    let state = state.lock().await;
    state.values.get(&key).cloned().unwrap_or(JsonValue::Null)
}

async fn whoami(Sender(sender): Sender) -> Json<String> {
    Json(sender.to_string())
}

/// Sleep for the given number of milliseconds, giving up early if the call is cancelled.
async fn sleep(Params((millis,)): Params<(u64,)>, token: CancellationToken) -> Result<&'static str, ErrorDetails> {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok("slept"),
        _ = token.cancelled() => Err(ErrorDetails::cancelled()),
    }
}

/// Always fail with a specific error that the caller can verify
async fn fail_with_error() -> Result<(), ErrorDetails> {
    Err(ErrorDetails::server_error(1, "Test error", None))
}

/// Always panic to exercise the panic handler
async fn fail_with_panic() -> Result<(), ErrorDetails> {
    panic!("OMG we're all gonna die!")
}
