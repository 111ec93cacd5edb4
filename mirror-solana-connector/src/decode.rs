//! Pluggable account decoding.
//!
//! Subscribers never interpret account bytes themselves beyond equality checks;
//! each watched key is bound to an [`AccountDecoder`] at construction.

use crate::error::DecodeError;
use anchor_lang::{AccountDeserialize, Discriminator};
use std::{marker::PhantomData, sync::Arc};

/// Turns raw account bytes into `T`.
pub trait AccountDecoder<T>: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<T, DecodeError>;
}

impl<T, F> AccountDecoder<T> for F
where
    F: Fn(&[u8]) -> Result<T, DecodeError> + Send + Sync,
{
    fn decode(&self, data: &[u8]) -> Result<T, DecodeError> {
        self(data)
    }
}

pub type SharedDecoder<T> = Arc<dyn AccountDecoder<T>>;

/// A schema-driven coder that knows how to decode every account type of a program.
pub trait AccountCoder: Send + Sync {
    type Account;

    fn decode(&self, account_type: &str, data: &[u8]) -> Result<Self::Account, DecodeError>;
}

/// Binds an [`AccountCoder`] to a single account-type name.
pub struct SchemaDecoder<C> {
    coder: Arc<C>,
    account_type: String,
}

impl<C: AccountCoder> SchemaDecoder<C> {
    pub fn new(coder: Arc<C>, account_type: impl Into<String>) -> Self {
        Self {
            coder,
            account_type: account_type.into(),
        }
    }

    pub fn account_type(&self) -> &str {
        &self.account_type
    }
}

impl<C: AccountCoder> AccountDecoder<C::Account> for SchemaDecoder<C> {
    fn decode(&self, data: &[u8]) -> Result<C::Account, DecodeError> {
        self.coder.decode(&self.account_type, data)
    }
}

/// Decodes Anchor accounts, checking the account discriminator first.
pub struct AnchorDecoder<T> {
    account_type: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T: AccountDeserialize + Discriminator> AnchorDecoder<T> {
    pub fn new() -> Self {
        Self {
            account_type: short_type_name::<T>(),
            _marker: PhantomData,
        }
    }
}

impl<T: AccountDeserialize + Discriminator> Default for AnchorDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: AccountDeserialize + Discriminator> AccountDecoder<T> for AnchorDecoder<T> {
    fn decode(&self, data: &[u8]) -> Result<T, DecodeError> {
        if !data.starts_with(T::DISCRIMINATOR) {
            return Err(DecodeError::Discriminator {
                account_type: self.account_type.to_string(),
            });
        }
        let mut buf = data;
        T::try_deserialize(&mut buf).map_err(|e| DecodeError::Invalid {
            account_type: self.account_type.to_string(),
            reason: e.to_string(),
        })
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
