use std::sync::Arc;

use anyhow::Result;
use log::{debug, info, warn};

use crate::broker::{Connector, LibraryStatus, MethodFrame, RpcError, Transport};
use crate::classify::{self, Resolution};
use crate::config::ConnectionConfig;
use crate::error::{ClientError, ErrorKind};
use crate::model::{self, ChannelNumber, FieldTable, FieldValue};
use crate::client_error;

/// One broker channel. The id is assigned when the channel is opened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelState {
    pub id: ChannelNumber,
    pub is_open: bool,
}

/// One broker link with the parameters it was opened with.
///
/// The link is `Some` exactly when the connection is connected, a disconnected state never keeps
/// a half open transport around.
pub struct ConnectionState {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    next_channel_id: ChannelNumber,
    /// Channel of the one-shot operations (declare, publish, get, etc).
    default_channel: ChannelState,
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("vhost", &self.config.vhost)
            .field("is_connected", &self.is_connected())
            .field("next_channel_id", &self.next_channel_id)
            .field("default_channel", &self.default_channel)
            .finish()
    }
}

/// Properties sent during the handshake. The `consumer_cancel_notify` capability makes the server
/// tell us when it cancels a consumer instead of silently stopping the deliveries.
pub(crate) fn client_properties() -> FieldTable {
    let mut capabilities = FieldTable::new();
    capabilities.insert("consumer_cancel_notify".to_string(), FieldValue::Bool(true));
    capabilities.insert("basic.nack".to_string(), FieldValue::Bool(true));
    capabilities.insert("authentication_failure_close".to_string(), FieldValue::Bool(true));

    let mut props = FieldTable::new();
    props.insert("product".to_string(), "metalmq-runtime".into());
    props.insert("version".to_string(), env!("CARGO_PKG_VERSION").into());
    props.insert("platform".to_string(), "Rust".into());
    props.insert("capabilities".to_string(), capabilities.into());

    props
}

fn not_connected<T>() -> Result<T> {
    client_error!(
        ErrorKind::ConnectionFatal,
        None,
        0,
        "Not connected to a server. Call reconnect() first.",
        0
    )
}

impl ConnectionState {
    /// Open a socket, authenticate and open the virtual host.
    pub fn connect(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let transport = open_link(&config, connector.as_ref()).map_err(|cause| connect_error("connect", cause))?;

        info!("Connected to {}:{}{}", config.host, config.port, config.vhost);

        Ok(ConnectionState {
            config,
            connector,
            transport: Some(transport),
            next_channel_id: 1,
            default_channel: ChannelState::default(),
        })
    }

    /// A new, not yet connected state with the same parameters. Used by the background engine
    /// which must not share the link with the foreground.
    pub(crate) fn detached(&self) -> Self {
        ConnectionState {
            config: self.config.clone(),
            connector: self.connector.clone(),
            transport: None,
            next_channel_id: 1,
            default_channel: ChannelState::default(),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Close the connection gracefully. Closing a closed connection does nothing.
    pub fn disconnect(&mut self) -> Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            info!("Connection is already closed");

            return Ok(());
        };

        let result = transport.connection_close(model::REPLY_SUCCESS, "Normal shutdown");

        match result {
            Ok(()) => {
                self.mark_disconnected();

                Ok(())
            }
            Err(e) => Err(self.rpc_error(None, "Failed to disconnect.", e)),
        }
    }

    /// Connect again with the stored parameters. Returns `false` if the connection was alive.
    pub fn reconnect(&mut self) -> Result<bool> {
        if self.is_connected() {
            return Ok(false);
        }

        let transport =
            open_link(&self.config, self.connector.as_ref()).map_err(|cause| connect_error("reconnect", cause))?;

        self.transport = Some(transport);
        self.next_channel_id = 1;
        self.default_channel = ChannelState::default();

        info!("Reconnected to {}:{}{}", self.config.host, self.config.port, self.config.vhost);

        Ok(true)
    }

    /// Drop the link without any handshake, the channels of it are closed implicitly.
    pub(crate) fn mark_disconnected(&mut self) {
        if self.transport.take().is_some() {
            debug!("Connection to {}:{} is marked closed", self.config.host, self.config.port);
        }

        self.default_channel.is_open = false;
    }

    /// Make sure that `chan` is open. Closed channels get a new, never used id.
    pub fn ensure_valid_channel(&mut self, chan: &mut ChannelState) -> Result<()> {
        if !self.is_connected() {
            chan.is_open = false;

            return not_connected();
        }

        if chan.is_open {
            return Ok(());
        }

        let Some(next) = self.next_channel_id.checked_add(1) else {
            return client_error!(
                ErrorKind::ConnectionFatal,
                None,
                model::ConnectionError::ChannelError as u16,
                "Channel ids of the connection are used up. Reconnect to get new ones.",
                model::CHANNEL_OPEN
            );
        };

        chan.id = self.next_channel_id;
        self.next_channel_id = next;

        let result = match self.transport.as_mut() {
            Some(transport) => transport.channel_open(chan.id),
            None => return not_connected(),
        };

        match result {
            Ok(()) => {
                debug!("Channel {} opened", chan.id);
                chan.is_open = true;

                Ok(())
            }
            Err(e) => Err(self.rpc_error(Some(chan), "Failed to open a channel.", e)),
        }
    }

    /// The server closed a channel which is not owned by a consumer.
    pub(crate) fn channel_closed_by_server(&mut self, channel: ChannelNumber) {
        if self.default_channel.id == channel {
            self.default_channel.is_open = false;
        }
    }

    /// Run `f` on an open channel. Broker errors are classified and the connection and channel
    /// state is updated accordingly.
    pub fn call<T, F>(&mut self, chan: &mut ChannelState, context: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Transport, ChannelNumber) -> Result<T, RpcError>,
    {
        self.ensure_valid_channel(chan)?;

        let result = match self.transport.as_mut() {
            Some(transport) => f(transport.as_mut(), chan.id),
            None => return not_connected(),
        };

        result.map_err(|e| self.rpc_error(Some(chan), context, e))
    }

    /// Run `f` on the default channel.
    pub fn call_default<T, F>(&mut self, context: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Transport, ChannelNumber) -> Result<T, RpcError>,
    {
        let mut chan = self.default_channel;
        let result = self.call(&mut chan, context, f);

        self.default_channel = chan;

        result
    }

    /// Close the channel if it is open. Failures are logged, the channel is considered closed
    /// anyway.
    pub fn close_channel(&mut self, chan: &mut ChannelState) {
        if !chan.is_open {
            return;
        }

        chan.is_open = false;

        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.channel_close(chan.id, model::REPLY_SUCCESS, "Normal shutdown") {
                warn!("Failed to close channel {}. {}", chan.id, e);

                if classify::classify(&e) == Resolution::ConnectionFatal {
                    self.mark_disconnected();
                }
            }
        }
    }

    /// Access the live link directly.
    pub(crate) fn transport(&mut self) -> Result<&mut (dyn Transport + 'static)> {
        match self.transport.as_mut() {
            Some(transport) => Ok(transport.as_mut()),
            None => not_connected(),
        }
    }

    /// Classify a broker error, update the state by the result and turn it into a client error.
    pub(crate) fn rpc_error(&mut self, chan: Option<&mut ChannelState>, context: &str, err: RpcError) -> anyhow::Error {
        anyhow::Error::new(self.absorb(chan, context, &err))
    }

    /// Same as `rpc_error` but for the failures which are only reported as warnings.
    pub(crate) fn absorb(&mut self, chan: Option<&mut ChannelState>, context: &str, err: &RpcError) -> ClientError {
        match classify::classify(err) {
            Resolution::ConnectionFatal => self.mark_disconnected(),
            Resolution::ChannelFatal { .. } => {
                if let Some(chan) = chan {
                    chan.is_open = false;
                }
            }
            _ => (),
        }

        classify::client_error(context, err)
    }
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.connection_close(model::REPLY_SUCCESS, "Normal shutdown") {
                debug!("Closing connection on drop failed {:?}", e);
            }
        }
    }
}

fn open_link(config: &ConnectionConfig, connector: &dyn Connector) -> Result<Box<dyn Transport>, RpcError> {
    let mut transport = connector.open(&config.host, config.port, config.timeout)?;

    if let Err(e) = transport.login(&config.vhost, &config.username, &config.password, &client_properties()) {
        // the server most likely closed the link already
        let _ = transport.connection_close(model::REPLY_SUCCESS, "Login failed");

        return Err(e);
    }

    Ok(transport)
}

fn connect_error(op: &str, err: RpcError) -> anyhow::Error {
    let cause = match &err {
        RpcError::Library(LibraryStatus::SocketError) => "Is the server running?".to_string(),
        RpcError::Library(status) => status.to_string(),
        other => other.to_string(),
    };

    let mut ce = ClientError::new(ErrorKind::ConnectionFatal, format!("Failed to {op} to server. {cause}"));

    if let RpcError::Server(MethodFrame::ConnectionClose(args)) = &err {
        ce.code = args.code;
        ce.class_method = args.class_method;
    }

    anyhow::Error::new(ce)
}
