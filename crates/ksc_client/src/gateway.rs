//! Gateway and tunnel connection keys.
//!
//! A key authorizes the next connection through a chain of slave servers.
//! It is consumed by turning it into credentials for a fresh
//! [`KscClient`]; the current client never tunnels by itself.

use crate::auth::{Credentials, Secret};
use crate::context::CallContext;
use crate::endpoint::Endpoint;
use crate::error::{KscError, KscResult};
use crate::session::KscClient;
use ksc_codec::{Params, Reply, Value, RET_VAL};
use std::fmt;
use tracing::debug;

const GATEWAY: &str = "GatewayConnection";

/// Reply field carrying the auth key.
pub const AUTH_KEY_FIELD: &str = "wstrAuthKey";

/// One hop of a gateway chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationDescriptor {
    /// Host id of the server at this hop.
    pub host_id: String,
    /// Component to connect to on that host.
    pub target_component: String,
    /// Whether traffic on this hop is compressed.
    pub compress_traffic: bool,
    /// Whether UDP packets on this hop are signed.
    pub sign_udp: bool,
}

impl LocationDescriptor {
    /// A hop with compression and UDP signing off.
    pub fn new(host_id: impl Into<String>, target_component: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            target_component: target_component.into(),
            compress_traffic: false,
            sign_udp: false,
        }
    }

    /// Sets traffic compression.
    #[must_use]
    pub fn with_compression(mut self, on: bool) -> Self {
        self.compress_traffic = on;
        self
    }

    /// Sets UDP signing.
    #[must_use]
    pub fn with_udp_signing(mut self, on: bool) -> Self {
        self.sign_udp = on;
        self
    }

    fn to_value(&self) -> Value {
        Value::tagged_params(
            Params::new()
                .with("location", self.host_id.as_str())
                .with("targetComponent", self.target_component.as_str())
                .with("compressTraffic", self.compress_traffic)
                .with("signUdp", self.sign_udp),
        )
    }
}

fn chain_params(locations: &[LocationDescriptor]) -> KscResult<Params> {
    if locations.is_empty() {
        return Err(KscError::validation("gateway chain is empty"));
    }
    if let Some(hop) = locations.iter().find(|l| l.host_id.is_empty()) {
        return Err(KscError::validation(format!(
            "gateway hop to {:?} has no host id",
            hop.target_component
        )));
    }
    let chain: Vec<Value> = locations.iter().map(LocationDescriptor::to_value).collect();
    Ok(Params::new().with("pLocations", chain))
}

/// A one-time gateway auth key.
///
/// Not cloneable: converting it into credentials consumes it. The server
/// documents a 60 second lifetime; the client does not enforce it.
pub struct GatewayKey(Secret);

impl GatewayKey {
    fn from_reply(client: &KscClient, endpoint: &Endpoint, reply: &Reply) -> KscResult<Self> {
        reply
            .get(AUTH_KEY_FIELD)
            .or_else(|| reply.get(RET_VAL))
            .and_then(Value::as_str)
            .filter(|key| !key.is_empty())
            .map(|key| Self(Secret::new(key)))
            .ok_or_else(|| KscError::Envelope {
                site: Box::new(client.site(endpoint)),
                source: ksc_codec::CodecError::unexpected_shape("reply carries no auth key"),
            })
    }

    /// Consumes the key into `KSCGW` credentials.
    pub fn into_credentials(self) -> Credentials {
        Credentials::Gateway(self.0)
    }

    /// Consumes the key into `KSCWT` credentials.
    pub fn into_web_credentials(self) -> Credentials {
        Credentials::TokenW(self.0)
    }
}

impl fmt::Debug for GatewayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GatewayKey({})", self.0.redacted())
    }
}

/// Obtains a key for a connection to the gateway at the end of the chain.
pub fn prepare_gateway(
    client: &KscClient,
    ctx: &CallContext,
    locations: &[LocationDescriptor],
) -> KscResult<GatewayKey> {
    let endpoint = Endpoint::known(GATEWAY, "PrepareGatewayConnection");
    let reply = client.call(ctx, &endpoint, chain_params(locations)?)?;
    debug!(hops = locations.len(), "gateway key issued");
    GatewayKey::from_reply(client, &endpoint, &reply)
}

/// Obtains a key for a tunnel to `host:port` behind the chain.
pub fn prepare_tunnel(
    client: &KscClient,
    ctx: &CallContext,
    locations: &[LocationDescriptor],
    target_host: &str,
    target_port: u16,
) -> KscResult<GatewayKey> {
    if target_host.is_empty() {
        return Err(KscError::validation("tunnel target host is empty"));
    }
    if target_port == 0 {
        return Err(KscError::validation("tunnel target port is zero"));
    }
    let endpoint = Endpoint::known(GATEWAY, "PrepareTunnelConnection");
    let params = chain_params(locations)?
        .with("szwTargetHost", target_host)
        .with("nTargetPort", i64::from(target_port));
    let reply = client.call(ctx, &endpoint, params)?;
    debug!(hops = locations.len(), target = %target_host, port = target_port, "tunnel key issued");
    GatewayKey::from_reply(client, &endpoint, &reply)
}
