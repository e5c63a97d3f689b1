//! STARTUP and authentication exchange
//!
//! Runs once per connection, before it is handed out:
//! STARTUP, then READY or AUTHENTICATE, then the optional `USE <keyspace>`.

use std::collections::HashMap;

use cqlwire_frame::request::{COMPRESSION, CQL_VERSION};
use cqlwire_frame::{ProtocolVersion, Request, Response};
use tracing::debug;

use super::{Connection, ConnectionState};
use crate::error::ConnectionError;

pub(super) async fn run(connection: &Connection, keyspace: Option<&str>) -> Result<(), ConnectionError> {
    let shared = &connection.shared;
    let config = &shared.config;

    let mut options = HashMap::from([(CQL_VERSION.to_string(), config.cql_version.clone())]);
    if let Some(compressor) = &config.compressor {
        options.insert(COMPRESSION.to_string(), compressor.name().to_string());
    }

    match connection.exchange(&Request::Startup(options)).await? {
        Response::Ready => {}
        Response::Authenticate { authenticator } => {
            shared.set_state(ConnectionState::Authenticating);
            authenticate(connection, &authenticator).await?;
        }
        Response::Error(error) => return Err(ConnectionError::Startup(error)),
        other => return Err(ConnectionError::UnexpectedResponse(other.kind())),
    }

    shared.set_state(ConnectionState::Ready);
    debug!(
        connection = shared.id,
        address = %shared.address,
        version = %config.protocol_version,
        "Connection ready"
    );

    if let Some(keyspace) = keyspace {
        connection.set_keyspace(keyspace).await?;
    }
    Ok(())
}

async fn authenticate(connection: &Connection, authenticator: &str) -> Result<(), ConnectionError> {
    let shared = &connection.shared;
    let Some(provider) = shared.config.auth.clone() else {
        return Err(ConnectionError::Authentication(format!(
            "Host {} requires authentication ({authenticator}) but no credentials are configured",
            shared.address
        )));
    };
    debug!(address = %shared.address, authenticator, "Authenticating");

    match shared.config.protocol_version {
        ProtocolVersion::V1 => {
            let credentials = provider.credentials(shared.address);
            match connection.exchange(&Request::Credentials(credentials)).await? {
                Response::Ready => Ok(()),
                Response::Error(error) => Err(ConnectionError::Authentication(error.message)),
                other => Err(ConnectionError::UnexpectedResponse(other.kind())),
            }
        }
        ProtocolVersion::V2 => {
            let mut sasl = provider.new_authenticator(shared.address, authenticator);
            let mut response = connection
                .exchange(&Request::AuthResponse(sasl.initial_response()))
                .await?;
            loop {
                match response {
                    Response::AuthChallenge(challenge) => {
                        let answer = sasl
                            .evaluate_challenge(challenge)
                            .map_err(ConnectionError::Authentication)?;
                        response = connection.exchange(&Request::AuthResponse(answer)).await?;
                    }
                    Response::AuthSuccess(token) => {
                        sasl.on_success(token);
                        return Ok(());
                    }
                    Response::Error(error) => {
                        return Err(ConnectionError::Authentication(error.message));
                    }
                    other => return Err(ConnectionError::UnexpectedResponse(other.kind())),
                }
            }
        }
    }
}
