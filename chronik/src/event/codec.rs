//! Codecs between domain event bodies and their discriminator-tagged raw
//! form.
//!
//! A [`Codec`] is owned by the store that registers it; there is no global
//! registry. Encoding assigns a fresh event id, stamps the domain time and
//! records `type = <prefix>:<kind>`; decoding dispatches on the discriminator
//! and deserializes the JSON body. A [`CodecUnion`] composes several codecs
//! by discriminator.

use std::{any::Any, fmt::Debug, marker::PhantomData, sync::Arc};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
    Error, Result,
    event::{EventId, RawEvent},
};

/// A domain event body that knows its kind discriminators.
///
/// The kind is the bare name (`created`, `changed`, …); the codec prepends
/// its prefix to form the persisted `type` discriminator.
pub trait EventBody: Clone + Debug + Send + Sync + Sized + 'static {
    /// The kind of this value.
    fn kind(&self) -> &'static str;

    /// Every kind a value of this type can take.
    fn kinds() -> &'static [&'static str];

    /// Serializes the body to its canonical JSON form.
    fn to_data(&self) -> Result<Value>;

    /// Deserializes a body of the given kind.
    fn from_data(kind: &str, data: Value) -> Result<Self>;
}

/// Encodes and decodes one event body type under a type-name prefix.
#[derive(Debug)]
pub struct Codec<E> {
    prefix: String,
    type_names: Vec<String>,
    _marker: PhantomData<fn() -> E>,
}

impl<E: EventBody> Codec<E> {
    /// Creates a codec registering every kind of `E` under `prefix`.
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            type_names: E::kinds()
                .iter()
                .map(|kind| format!("{prefix}:{kind}"))
                .collect(),
            _marker: PhantomData,
        }
    }

    /// The codec's type-name prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Every registered type discriminator, in kind order.
    pub fn type_names(&self) -> &[String] {
        &self.type_names
    }

    /// Returns true if the discriminator is registered here.
    pub fn contains_type_name(&self, type_name: &str) -> bool {
        self.type_names.iter().any(|t| t == type_name)
    }

    /// Encodes a body occurring now.
    pub fn encode(&self, body: &E) -> Result<RawEvent> {
        self.encode_at(body, Utc::now())
    }

    /// Encodes a body with an explicit domain time.
    pub fn encode_at(&self, body: &E, occurred_on: DateTime<Utc>) -> Result<RawEvent> {
        let mut event = RawEvent::new(
            format!("{}:{}", self.prefix, body.kind()),
            occurred_on,
            body.to_data()?,
        );
        if event.id.is_empty() {
            event.id = EventId::make();
        }
        Ok(event)
    }

    /// Decodes a raw event back into its body.
    pub fn decode(&self, raw: &RawEvent) -> Result<E> {
        let Some(kind) = raw
            .event_type
            .strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix(':'))
        else {
            return Err(Error::Codec(format!(
                "type {:?} is not registered with prefix {:?}",
                raw.event_type, self.prefix
            )));
        };
        if !E::kinds().contains(&kind) {
            return Err(Error::Codec(format!(
                "type {:?} is not registered",
                raw.event_type
            )));
        }
        E::from_data(kind, raw.data.clone())
    }
}

/// One member of a [`CodecUnion`]; implemented by every [`Codec`].
pub trait CodecMember: Send + Sync {
    /// Returns true if the discriminator is registered here.
    fn contains_type_name(&self, type_name: &str) -> bool;

    /// Every registered type discriminator.
    fn member_type_names(&self) -> &[String];

    /// Decodes into a type-erased body.
    fn decode_boxed(&self, raw: &RawEvent) -> Result<Box<dyn Any + Send>>;
}

impl<E: EventBody> CodecMember for Codec<E> {
    fn contains_type_name(&self, type_name: &str) -> bool {
        Codec::contains_type_name(self, type_name)
    }

    fn member_type_names(&self) -> &[String] {
        self.type_names()
    }

    fn decode_boxed(&self, raw: &RawEvent) -> Result<Box<dyn Any + Send>> {
        Ok(Box::new(self.decode(raw)?))
    }
}

/// Composes codecs, dispatching on the type discriminator.
#[derive(Default)]
pub struct CodecUnion {
    members: Vec<Arc<dyn CodecMember>>,
}

impl CodecUnion {
    /// Creates an empty union.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member codec.
    #[must_use]
    pub fn with(mut self, member: Arc<dyn CodecMember>) -> Self {
        self.members.push(member);
        self
    }

    /// Returns true if any member registers the discriminator.
    pub fn contains_type_name(&self, type_name: &str) -> bool {
        self.members.iter().any(|m| m.contains_type_name(type_name))
    }

    /// Decodes a raw event through the member owning its discriminator.
    pub fn decode<E: 'static>(&self, raw: &RawEvent) -> Result<E> {
        let member = self
            .members
            .iter()
            .find(|m| m.contains_type_name(&raw.event_type))
            .ok_or_else(|| Error::Codec(format!("no codec for type {:?}", raw.event_type)))?;
        member
            .decode_boxed(raw)?
            .downcast::<E>()
            .map(|boxed| *boxed)
            .map_err(|_| {
                Error::Codec(format!(
                    "type {:?} does not decode to the requested body type",
                    raw.event_type
                ))
            })
    }
}

impl Debug for CodecUnion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&String> = self
            .members
            .iter()
            .flat_map(|m| m.member_type_names())
            .collect();
        f.debug_struct("CodecUnion").field("types", &names).finish()
    }
}
