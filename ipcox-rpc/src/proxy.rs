//! Client-side stand-ins for remote servers.
//!
//! A [`ProxyProvider`] turns a server path into an [`RpcProxy`] by running the host handshake
//! (see [`crate::host`]) over a multiplexed connection.  Proxies are cached per path, so asking
//! twice for the same path returns the same proxy until it is disposed.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ipcox_core::sync::MutexExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::channel::RPC_CHANNELS;
use crate::client::{RpcClient, RpcClientConfig};
use crate::event::{Emitter, Subscription};
use crate::host::{HOST_CHANNEL, port_forward_channel};
use crate::multiplexer::{Channel, ChannelMultiplexer};
use crate::router::rpc_method_name;
use crate::types::JsonValue;
use crate::{MessagePort, Result, RpcError};

#[derive(Clone)]
pub struct ProxyProvider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    multiplexer: ChannelMultiplexer,
    config: RpcClientConfig,
    /// Held for the whole handshake, so concurrent requests for one path share a proxy
    control: tokio::sync::Mutex<Option<RpcClient>>,
    proxies: Mutex<HashMap<String, RpcProxy>>,
}

impl ProxyProvider {
    pub fn new(multiplexer: ChannelMultiplexer) -> Self {
        Self::with_config(multiplexer, RpcClientConfig::default())
    }

    /// The config applies to the control channel and to every proxy.
    pub fn with_config(multiplexer: ChannelMultiplexer, config: RpcClientConfig) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                multiplexer,
                config,
                control: tokio::sync::Mutex::new(None),
                proxies: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The proxy of the server at `path`, creating it on first use.
    #[tracing::instrument(skip(self))]
    pub async fn get_proxy(&self, path: &str) -> Result<RpcProxy> {
        let mut control_slot = self.inner.control.lock().await;

        let cached = self.inner.proxies.lock_unpoisoned().get(path).cloned();
        if let Some(proxy) = cached {
            if !proxy.is_disposed() {
                return Ok(proxy);
            }
            tracing::debug!("Cached proxy was disposed; creating a new one");
        }

        let existing = control_slot.as_ref().filter(|client| !client.is_disposed()).cloned();
        let control = match existing {
            Some(client) => client,
            None => {
                let channel = self.inner.multiplexer.open(HOST_CHANNEL).await?;
                let client = RpcClient::for_port(Arc::new(channel), self.inner.config.clone());
                *control_slot = Some(client.clone());
                client
            }
        };

        let proxy_id: u64 = from_result(
            control
                .send_request(RPC_CHANNELS.create.member(), vec![JsonValue::from(path)], None)
                .await?,
        )?;

        let channel = self.inner.multiplexer.open(port_forward_channel(proxy_id)).await?;
        let proxy = RpcProxy::new(path, proxy_id, control, channel, self.inner.config.clone())?;
        tracing::debug!(proxy_id, "Created proxy");

        self.inner
            .proxies
            .lock_unpoisoned()
            .insert(path.to_string(), proxy.clone());
        Ok(proxy)
    }

    pub fn multiplexer(&self) -> &ChannelMultiplexer {
        &self.inner.multiplexer
    }
}

/// Client-side stand-in for one remote server.
///
/// Method and event names may be given with or without the leading `$`.
#[derive(Clone)]
pub struct RpcProxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    path: String,
    proxy_id: u64,
    client: RpcClient,
    control: RpcClient,
    channel: Channel,
    events: Arc<Mutex<HashMap<String, Emitter<JsonValue>>>>,
}

impl RpcProxy {
    fn new(path: &str, proxy_id: u64, control: RpcClient, channel: Channel, config: RpcClientConfig) -> Result<Self> {
        let client = RpcClient::for_port(Arc::new(channel.clone()), config);
        let events: Arc<Mutex<HashMap<String, Emitter<JsonValue>>>> = Arc::new(Mutex::new(HashMap::new()));

        let event_emitters = events.clone();
        client.handle_notification(move |event, mut params| {
            let emitter = event_emitters.lock_unpoisoned().get(&event).cloned();
            match emitter {
                Some(emitter) => {
                    let value = if params.is_empty() {
                        JsonValue::Null
                    } else {
                        params.swap_remove(0)
                    };
                    emitter.fire(&value);
                }
                None => tracing::trace!(%event, "Event without listeners"),
            }
            futures::future::ready(Ok(()))
        })?;

        Ok(Self {
            inner: Arc::new(ProxyInner {
                path: path.to_string(),
                proxy_id,
                client,
                control,
                channel,
                events,
            }),
        })
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn proxy_id(&self) -> u64 {
        self.inner.proxy_id
    }

    /// Call `method` and deserialize its result.
    ///
    /// `params` is sent as the positional params: a tuple or sequence as is, `()` as no params,
    /// anything else as the single param.  A `Vec` or array is spread too, so `vec![1, 2]` is two
    /// params; pass `(vec![1, 2],)` to send it as one.
    pub async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
        self.request(method, params, None).await
    }

    /// Like [`Self::call`], cancelled when `token` fires.
    pub async fn call_with_token<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
        token: CancellationToken,
    ) -> Result<R> {
        self.request(method, params, Some(token)).await
    }

    async fn request<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
        token: Option<CancellationToken>,
    ) -> Result<R> {
        let method = rpc_method_name(method);
        let result = self
            .inner
            .client
            .send_request(&method, to_params(params)?, token)
            .await?;
        from_result(result)
    }

    /// Call `method` through the server's synchronous path.
    ///
    /// The server answers from the handler's first poll, so this only works for methods that
    /// never suspend.
    pub async fn call_sync<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
        let method = rpc_method_name(method);
        let request = vec![
            JsonValue::from(self.inner.proxy_id),
            JsonValue::from(method.as_ref()),
            JsonValue::Array(to_params(params)?),
        ];
        let result = self
            .inner
            .control
            .send_request(RPC_CHANNELS.request_sync.member(), request, None)
            .await?;
        from_result(result)
    }

    /// Send a notification to `method`.  `params` are spread as in [`Self::call`].
    pub fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        self.inner
            .client
            .send_notification(&rpc_method_name(method), to_params(params)?)
    }

    /// Listen for `event`.  Values that don't deserialize as `T` are logged and skipped.
    pub fn on_event<T, F>(&self, event: &str, listener: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let event = rpc_method_name(event).into_owned();
        let emitter = self
            .inner
            .events
            .lock_unpoisoned()
            .entry(event.clone())
            .or_default()
            .clone();

        emitter.listen(move |value: &JsonValue| match serde_json::from_value::<T>(value.clone()) {
            Ok(value) => listener(value),
            Err(e) => tracing::warn!(%event, error = %e, "Dropping event that failed to deserialize"),
        })
    }

    /// Stop using the proxy and close its port.  Calls still waiting fail with
    /// [`RpcError::Disposed`].
    pub fn dispose(&self) {
        if self.inner.client.is_disposed() {
            return;
        }
        self.inner.client.dispose();
        self.inner.channel.close("Proxy disposed");
        for emitter in self.inner.events.lock_unpoisoned().values() {
            emitter.clear();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.client.is_disposed()
    }
}

impl std::fmt::Debug for RpcProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcProxy")
            .field("path", &self.inner.path)
            .field("proxy_id", &self.inner.proxy_id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Positional params from any serializable value.  Sequences are spread.
fn to_params<P: Serialize>(params: P) -> Result<Vec<JsonValue>> {
    let value = serde_json::to_value(params).map_err(|source| RpcError::Serialize {
        source,
        type_name: std::any::type_name::<P>(),
    })?;
    Ok(match value {
        JsonValue::Array(params) => params,
        JsonValue::Null => Vec::new(),
        other => vec![other],
    })
}

fn from_result<R: DeserializeOwned>(result: JsonValue) -> Result<R> {
    serde_json::from_value(result.clone()).map_err(|source| RpcError::Deserialize {
        source,
        type_name: std::any::type_name::<R>(),
        value: result,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn params_from_values() {
        assert_eq!(to_params(()).unwrap(), Vec::<JsonValue>::new());
        assert_eq!(to_params((1, "two")).unwrap(), vec![json!(1), json!("two")]);
        assert_eq!(to_params([1, 2]).unwrap(), vec![json!(1), json!(2)]);
        assert_eq!(to_params("solo").unwrap(), vec![json!("solo")]);
        assert_eq!(to_params(json!({"a": 1})).unwrap(), vec![json!({"a": 1})]);
    }

    #[test]
    fn one_element_tuple_keeps_a_sequence_whole() {
        assert_eq!(to_params(vec![1, 2]).unwrap(), vec![json!(1), json!(2)]);
        assert_eq!(to_params((vec![1, 2],)).unwrap(), vec![json!([1, 2])]);
    }
}
