// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of the AMQP connection and the channel every
//! publish, declaration and subscription of a broker goes through.

use crate::errors::AmqpError;
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Reply code sent to the broker on an orderly close.
pub(crate) const REPLY_SUCCESS: u16 = 200;

/// Opens a connection to `uri` and a channel on it.
///
/// When the channel can not be created the connection is closed before the error
/// is returned, so a failed setup never leaks a connection.
///
/// # Example
/// ```ignore
/// let (conn, channel) = new_amqp_channel("amqp://localhost:5672/%2f", "jobs-api").await?;
/// ```
pub async fn new_amqp_channel(
    uri: &str,
    connection_name: &str,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(connection_name.to_owned()));

    let conn = match Connection::connect(uri, options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            if let Err(close_err) = conn.close(REPLY_SUCCESS, "channel creation failed").await {
                warn!(
                    error = close_err.to_string(),
                    "failure to close the connection after channel error"
                );
            }
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }
}
