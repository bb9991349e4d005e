// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The GSC proxy relay: shuttles relay messages between the GSC and the CSME
//! until the GSC ends the exchange.

use crate::channel::ChannelError;
use crate::channel::RelayChannel;
use crate::codec;
use crate::codec::CodecError;
use crate::config::PxpConfig;
use pxp_backing::DmaClient;
use pxp_backing::GscEngine;
use pxp_backing::TransportError;
use pxp_backing::TrustAuthority;
use pxp_spec::gsc::GscClientId;
use pxp_spec::proxy::ProxyAddress;
use pxp_spec::proxy::ProxyHeader;
use pxp_spec::proxy::ProxyMsgType;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// A relay exchange failed.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The GSC packet exchange failed.
    #[error("gsc channel failure")]
    Channel(#[source] ChannelError),
    /// A relay message violated the protocol.
    #[error("relay protocol violation")]
    Protocol(#[source] CodecError),
    /// A relay message is shorter than its header.
    #[error("relay message of {0} bytes is too small")]
    ReplyTooSmall(usize),
    /// The CSME exchange failed.
    #[error("trust authority exchange failed")]
    TrustAuthority(#[source] TransportError),
    /// The GSC did not end the exchange.
    #[error("relay did not end after {0} round trips")]
    RoundTripCap(u32),
}

/// Drives relay exchanges over the proxy client.
pub(crate) struct RelayPump {
    channel: RelayChannel,
    trust_authority: Arc<dyn TrustAuthority>,
    max_round_trips: u32,
}

fn read_relay_header(msg: &[u8]) -> Result<ProxyHeader, RelayError> {
    ProxyHeader::read_from_prefix(msg)
        .map(|(header, _)| header)
        .map_err(|_| RelayError::ReplyTooSmall(msg.len()))
}

fn validate(
    header: &ProxyHeader,
    from: ProxyAddress,
    to: ProxyAddress,
    available: usize,
) -> Result<(), RelayError> {
    codec::validate_proxy_header(header, from, to, available).map_err(|err| {
        tracing::error!(
            ?header,
            error = &err as &dyn std::error::Error,
            "invalid relay message"
        );
        RelayError::Protocol(err)
    })
}

impl RelayPump {
    pub fn new(
        engine: Arc<dyn GscEngine>,
        trust_authority: Arc<dyn TrustAuthority>,
        dma_client: &dyn DmaClient,
        config: &PxpConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            channel: RelayChannel::new(engine, dma_client, GscClientId::PROXY, config)?,
            trust_authority,
            max_round_trips: config.max_relay_round_trips,
        })
    }

    /// Runs one exchange, starting with a query, and returns the number of
    /// GSC round trips it took.
    pub fn exchange(&self) -> Result<u32, RelayError> {
        let mut channel = self.channel.lock();
        let capacity = self.channel.max_payload();
        let mut to_gsc = ProxyHeader::query().as_bytes().to_vec();
        let mut from_gsc = vec![0; capacity];
        let mut from_csme = vec![0; capacity];

        for round_trip in 1..=self.max_round_trips {
            let len = channel
                .send(0, &to_gsc, false, &mut from_gsc)
                .map_err(RelayError::Channel)?;
            let received = &from_gsc[..len];
            let header = read_relay_header(received)?;

            if header.msg_type() == ProxyMsgType::END {
                validate(&header, ProxyAddress::GSC, ProxyAddress::KMD, len)?;
                tracing::debug!(round_trip, "relay exchange complete");
                return Ok(round_trip);
            }

            validate(&header, ProxyAddress::GSC, ProxyAddress::CSME, len)?;
            tracing::trace!(
                round_trip,
                msg_type = ?header.msg_type(),
                length = header.payload_length(),
                "forwarding relay message to csme"
            );

            let n = self
                .trust_authority
                .exchange(&received[..header.message_size()], &mut from_csme)
                .map_err(RelayError::TrustAuthority)?;
            let reply = from_csme
                .get(..n)
                .ok_or(RelayError::TrustAuthority(TransportError::ReplyTooLarge(n)))?;
            let reply_header = read_relay_header(reply)?;
            validate(&reply_header, ProxyAddress::CSME, ProxyAddress::GSC, n)?;

            to_gsc.clear();
            to_gsc.extend_from_slice(&reply[..reply_header.message_size()]);
        }

        tracing::error!(
            max_round_trips = self.max_round_trips,
            "relay exchange did not end"
        );
        Err(RelayError::RoundTripCap(self.max_round_trips))
    }
}
