use super::parse::ProgramLog;
use anchor_lang::{AnchorDeserialize, Discriminator};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// An event decoded from one program log line.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent<E> {
    pub event_type: String,
    pub payload: E,
}

/// Turns program log lines into typed events.
///
/// Lines that carry no event decode to `None`.
pub trait EventCoder: Send + Sync + 'static {
    type Event: Clone + Send + Sync + 'static;

    fn decode(&self, log: &ProgramLog) -> Option<DecodedEvent<Self::Event>>;
}

type DecodeFn<E> = Box<dyn Fn(&[u8]) -> Option<E> + Send + Sync>;

struct AnchorEvent<E> {
    name: String,
    discriminator: Vec<u8>,
    decode: DecodeFn<E>,
}

/// Decodes Anchor `emit!` events from `Program data:` lines by their 8-byte
/// discriminator.
///
/// ```ignore
/// let coder = AnchorEventCoder::new()
///     .with_event::<Deposited>(BankEvent::Deposited)
///     .with_event::<Withdrawn>(BankEvent::Withdrawn);
/// ```
pub struct AnchorEventCoder<E> {
    events: Vec<AnchorEvent<E>>,
}

impl<E> Default for AnchorEventCoder<E> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

impl<E> AnchorEventCoder<E>
where
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers event `T`, named after its type, wrapped into `E` by `map`.
    pub fn with_event<T>(self, map: fn(T) -> E) -> Self
    where
        T: AnchorDeserialize + Discriminator + 'static,
    {
        let full = std::any::type_name::<T>();
        let name = full.rsplit("::").next().unwrap_or(full).to_string();
        self.with_named_event::<T>(name, map)
    }

    pub fn with_named_event<T>(mut self, name: impl Into<String>, map: fn(T) -> E) -> Self
    where
        T: AnchorDeserialize + Discriminator + 'static,
    {
        self.events.push(AnchorEvent {
            name: name.into(),
            discriminator: T::DISCRIMINATOR.to_vec(),
            decode: Box::new(move |data| T::try_from_slice(data).ok().map(map)),
        });
        self
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(|event| event.name.as_str())
    }
}

impl<E> EventCoder for AnchorEventCoder<E>
where
    E: Clone + Send + Sync + 'static,
{
    type Event = E;

    fn decode(&self, log: &ProgramLog) -> Option<DecodedEvent<E>> {
        let ProgramLog::Data(encoded) = log else {
            return None;
        };
        let bytes = match BASE64.decode(encoded.trim()) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!("Skipping malformed program data: {}", e);
                return None;
            }
        };

        let event = self
            .events
            .iter()
            .find(|event| bytes.starts_with(&event.discriminator))?;
        match (event.decode)(&bytes[event.discriminator.len()..]) {
            Some(payload) => Some(DecodedEvent {
                event_type: event.name.clone(),
                payload,
            }),
            None => {
                tracing::warn!(event_type = %event.name, "Failed to deserialize event payload");
                None
            }
        }
    }
}
