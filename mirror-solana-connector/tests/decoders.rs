use anchor_lang::prelude::*;
use mirror_solana_connector::{
    decode::{AccountCoder, AccountDecoder, AnchorDecoder, SchemaDecoder},
    DecodeError,
};
use std::sync::Arc;

declare_id!("Fg6PaFpoGXkYsidMpWTK6W2BeZ7FEfcYkg476zPFsLnS");

#[derive(Debug, PartialEq)]
#[account]
pub struct Vault {
    pub authority: Pubkey,
    pub balance: u64,
}

fn vault_bytes(vault: &Vault) -> Vec<u8> {
    let mut data = Vec::new();
    vault.try_serialize(&mut data).unwrap();
    data
}

#[test]
fn test_anchor_decoder_checks_discriminator() {
    let vault = Vault {
        authority: Pubkey::new_from_array([4; 32]),
        balance: 900,
    };
    let decoder = AnchorDecoder::<Vault>::new();

    let decoded = decoder.decode(&vault_bytes(&vault)).unwrap();
    assert_eq!(decoded, vault);

    let mut wrong = vault_bytes(&vault);
    wrong[0] ^= 0xff;
    let err = decoder.decode(&wrong).unwrap_err();
    assert!(matches!(err, DecodeError::Discriminator { ref account_type } if account_type == "Vault"));

    let truncated = &vault_bytes(&vault)[..12];
    assert!(matches!(
        decoder.decode(truncated),
        Err(DecodeError::Invalid { .. })
    ));
}

/// Knows two account layouts of a toy program.
struct ToyCoder;

#[derive(Debug, PartialEq)]
enum ToyAccount {
    Counter(u64),
    Flag(bool),
}

impl AccountCoder for ToyCoder {
    type Account = ToyAccount;

    fn decode(&self, account_type: &str, data: &[u8]) -> std::result::Result<ToyAccount, DecodeError> {
        let invalid = |reason: &str| DecodeError::Invalid {
            account_type: account_type.to_string(),
            reason: reason.to_string(),
        };
        match account_type {
            "Counter" => {
                let bytes: [u8; 8] = data.try_into().map_err(|_| invalid("expected 8 bytes"))?;
                Ok(ToyAccount::Counter(u64::from_le_bytes(bytes)))
            }
            "Flag" => match data {
                [0] => Ok(ToyAccount::Flag(false)),
                [1] => Ok(ToyAccount::Flag(true)),
                _ => Err(invalid("expected one boolean byte")),
            },
            other => Err(invalid(&format!("unknown account type {}", other))),
        }
    }
}

#[test]
fn test_schema_decoder_binds_one_account_type() {
    let coder = Arc::new(ToyCoder);
    let counter = SchemaDecoder::new(coder.clone(), "Counter");
    let flag = SchemaDecoder::new(coder, "Flag");

    assert_eq!(counter.account_type(), "Counter");
    assert_eq!(counter.decode(&7u64.to_le_bytes()).unwrap(), ToyAccount::Counter(7));
    assert_eq!(flag.decode(&[1]).unwrap(), ToyAccount::Flag(true));
    assert!(flag.decode(&7u64.to_le_bytes()).is_err());
}

#[test]
fn test_closures_are_decoders() {
    let decoder = |data: &[u8]| -> std::result::Result<usize, DecodeError> { Ok(data.len()) };
    assert_eq!(AccountDecoder::decode(&decoder, &[1, 2, 3]).unwrap(), 3);
}
