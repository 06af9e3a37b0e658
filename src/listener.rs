//! One accept loop per configured endpoint.

use std::{
    io::Error,
    net::{IpAddr, Ipv6Addr, SocketAddrV6},
    rc::Rc,
};

use tokio::{net::TcpListener, task::spawn_local};

use crate::{config::Endpoint, relay::BufferPool, socks};

/// Binds an endpoint's listening port and serves it forever. Returns only if the bind itself
/// fails or the accept loop hits an unrecoverable error; per-connection failures are logged
/// and the loop keeps going.
pub async fn run_endpoint(endpoint: Endpoint, pool: Rc<BufferPool>) -> Error {
    let bind_address = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, endpoint.port, 0, 0);
    let listener = match TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(port = endpoint.port, %error, "failed to bind listening socket");
            return error;
        }
    };

    tracing::info!("listening on {endpoint}");

    let outbound = IpAddr::V6(endpoint.address);
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                spawn_local(socks::handle_session(stream, peer, outbound, Rc::clone(&pool)));
            }
            Err(error) => {
                // Transient per-connection conditions (e.g. EMFILE) must not kill the endpoint
                tracing::warn!(port = endpoint.port, %error, "failed to accept incoming connection");
            }
        }
    }
}
