//! Operation codec: turns operations into packets and back.
//!
//! The packet header carries the call id, partition and urgency. The payload
//! is a MessagePack envelope naming the operation kind plus the operation's
//! own serialized body. Decoding looks the kind up in a registry of factories
//! and rebuilds the [`OperationContext`] from the header.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use gridline_core::{Packet, PacketKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{Caller, Operation, OperationContext};

/// Errors from encoding or decoding operation packets.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("operation kind {kind} is not serializable")]
    NotSerializable { kind: String },
    #[error("no decoder registered for operation kind {0}")]
    UnknownKind(String),
    #[error("expected an operation packet, got a response")]
    NotAnOperation,
    #[error("failed to encode operation: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode operation: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Builds an operation from its decoded context and serialized body.
pub type OperationFactory =
    Arc<dyn Fn(OperationContext, &[u8]) -> Result<Box<dyn Operation>, CodecError> + Send + Sync>;

#[derive(Serialize, Deserialize)]
struct Envelope {
    kind: String,
    #[serde(with = "serde_bytes")]
    body: Vec<u8>,
}

/// Serializes an operation body as named MessagePack.
///
/// # Errors
///
/// Returns `CodecError::Encode` if serialization fails.
pub fn encode_body<T: Serialize + ?Sized>(body: &T) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(body)?)
}

/// Registry of operation decoders keyed by [`Operation::kind`].
#[derive(Default)]
pub struct OperationCodec {
    factories: DashMap<String, OperationFactory>,
}

impl OperationCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for `kind`, replacing any previous one.
    pub fn register<F>(&self, kind: impl Into<String>, factory: F)
    where
        F: Fn(OperationContext, &[u8]) -> Result<Box<dyn Operation>, CodecError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    /// Registers a serde-deserializable operation type under `kind`.
    ///
    /// The decoded operation's context is overwritten with the one rebuilt
    /// from the packet header.
    pub fn register_serde<O>(&self, kind: impl Into<String>)
    where
        O: Operation + DeserializeOwned,
    {
        self.register(kind, |ctx, body| {
            let mut op: O = rmp_serde::from_slice(body)?;
            *op.ctx_mut() = ctx;
            Ok(Box::new(op) as Box<dyn Operation>)
        });
    }

    #[must_use]
    pub fn is_registered(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Encodes `op` into an operation packet.
    ///
    /// # Errors
    ///
    /// Returns `CodecError` if the operation cannot be serialized.
    pub fn encode(&self, op: &dyn Operation) -> Result<Packet, CodecError> {
        let ctx = op.ctx();
        let envelope = Envelope {
            kind: op.kind().to_string(),
            body: op.encode_body()?,
        };
        let payload = Bytes::from(rmp_serde::to_vec_named(&envelope)?);
        Ok(
            Packet::operation(ctx.partition_id, ctx.call_id.unwrap_or(0), payload)
                .with_urgent(ctx.urgent),
        )
    }

    /// Decodes an operation packet.
    ///
    /// # Errors
    ///
    /// Returns `CodecError` for response packets, malformed payloads or kinds
    /// without a registered factory.
    pub fn decode(&self, packet: &Packet) -> Result<Box<dyn Operation>, CodecError> {
        if packet.kind() != PacketKind::Operation {
            return Err(CodecError::NotAnOperation);
        }
        let envelope: Envelope = rmp_serde::from_slice(packet.payload())?;
        let factory = self
            .factories
            .get(&envelope.kind)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CodecError::UnknownKind(envelope.kind.clone()))?;
        factory(context_from_header(packet), &envelope.body)
    }
}

impl std::fmt::Debug for OperationCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationCodec")
            .field("kinds", &self.factories.len())
            .finish()
    }
}

/// Rebuilds the operation context carried by a packet header.
#[must_use]
pub fn context_from_header(packet: &Packet) -> OperationContext {
    OperationContext {
        call_id: (packet.call_id() != 0).then_some(packet.call_id()),
        partition_id: packet.partition_id(),
        urgent: packet.is_urgent(),
        caller: packet
            .origin()
            .map_or(Caller::Local, |node| Caller::Remote(node.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationError;

    #[derive(Serialize, Deserialize)]
    struct PutOp {
        #[serde(skip)]
        ctx: OperationContext,
        key: String,
        value: i64,
    }

    impl Operation for PutOp {
        fn ctx(&self) -> &OperationContext {
            &self.ctx
        }

        fn ctx_mut(&mut self) -> &mut OperationContext {
            &mut self.ctx
        }

        fn run(&mut self) -> Result<rmpv::Value, OperationError> {
            Ok(rmpv::Value::from(self.value))
        }

        fn kind(&self) -> &'static str {
            "put"
        }

        fn encode_body(&self) -> Result<Vec<u8>, CodecError> {
            encode_body(self)
        }
    }

    fn codec() -> OperationCodec {
        let codec = OperationCodec::new();
        codec.register_serde::<PutOp>("put");
        codec
    }

    #[test]
    fn operation_survives_packet_transport() {
        let codec = codec();
        let op = PutOp {
            ctx: OperationContext::partition(42).with_call_id(9).with_urgent(true),
            key: "k".to_string(),
            value: 5,
        };
        let packet = codec.encode(&op).unwrap();
        assert_eq!(packet.partition_id(), Some(42));
        assert_eq!(packet.call_id(), 9);
        assert!(packet.is_urgent());

        let inbound = Packet::from_frame(packet.to_frame())
            .unwrap()
            .with_origin("node-a");
        let mut decoded = codec.decode(&inbound).unwrap();
        assert_eq!(decoded.kind(), "put");
        assert_eq!(decoded.ctx().partition_id, Some(42));
        assert_eq!(decoded.ctx().call_id, Some(9));
        assert_eq!(decoded.ctx().caller, Caller::Remote("node-a".to_string()));
        assert_eq!(decoded.run().unwrap(), rmpv::Value::from(5));
    }

    #[test]
    fn fire_and_forget_has_no_call_id() {
        let codec = codec();
        let op = PutOp {
            ctx: OperationContext::generic(),
            key: "k".to_string(),
            value: 1,
        };
        let decoded = codec.decode(&codec.encode(&op).unwrap()).unwrap();
        assert_eq!(decoded.ctx().call_id, None);
        assert_eq!(decoded.ctx().partition_id, None);
        assert_eq!(decoded.ctx().caller, Caller::Local);
    }

    #[test]
    fn unknown_kind_is_reported() {
        let sender = codec();
        let receiver = OperationCodec::new();
        let packet = sender
            .encode(&PutOp {
                ctx: OperationContext::generic(),
                key: "k".to_string(),
                value: 1,
            })
            .unwrap();
        assert!(!receiver.is_registered("put"));
        assert!(matches!(
            receiver.decode(&packet),
            Err(CodecError::UnknownKind(kind)) if kind == "put"
        ));
    }

    #[test]
    fn garbage_payload_and_responses_are_rejected() {
        let codec = codec();
        let garbage = Packet::operation(Some(1), 0, Bytes::from_static(&[0xc1]));
        assert!(matches!(codec.decode(&garbage), Err(CodecError::Decode(_))));

        let response = Packet::response(1, Bytes::new());
        assert!(matches!(
            codec.decode(&response),
            Err(CodecError::NotAnOperation)
        ));
    }
}
