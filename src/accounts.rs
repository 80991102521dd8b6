//! Account resolution: config entries -> indices -> derived accounts.

use alloy_primitives::Address;

use crate::config::{AccountSelector, DerivationFn};
use crate::error::LedgerError;
use crate::signer::Signer;
use crate::types::{Account, Bip32Path};

/// Indices named by `selectors`, in order, duplicates kept.
///
/// A number is an index; a string is an index when it parses fully as
/// one, otherwise the trailing index of a BIP44 path. Anything else is
/// skipped. An empty result defaults to `[0]`.
pub fn parse_account_indices(selectors: &[AccountSelector]) -> Vec<u32> {
    let mut indices: Vec<u32> = selectors
        .iter()
        .filter_map(|selector| {
            let index = match selector {
                AccountSelector::Index(i) => Some(*i),
                AccountSelector::Text(s) => s.parse::<u32>().ok().or_else(|| {
                    s.parse::<Bip32Path>()
                        .ok()
                        .and_then(|path| path.bip44_index())
                }),
                AccountSelector::Other(_) => None,
            };
            if index.is_none() {
                log::warn!("skipping account entry {selector:?}");
            }
            index
        })
        .collect();

    if indices.is_empty() {
        indices.push(0);
    }
    indices
}

/// The fixed set of accounts a provider signs for.
#[derive(Debug, Clone, Default)]
pub struct AccountRegistry {
    accounts: Vec<Account>,
}

impl AccountRegistry {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self { accounts }
    }

    /// Derive one account per index through the device.
    pub async fn resolve(
        selectors: &[AccountSelector],
        derivation: &DerivationFn,
        signer: &Signer,
    ) -> Result<Self, LedgerError> {
        let mut accounts = Vec::new();
        for index in parse_account_indices(selectors) {
            let derivation_path = derivation(index);
            let path: Bip32Path = derivation_path.parse()?;
            let info = signer.get_address(&path, false).await?;
            log::debug!("account {index}: {} at {derivation_path}", info.address);
            accounts.push(Account {
                address: info.address,
                public_key: info.public_key_hex(),
                derivation_path,
            });
        }
        Ok(Self { accounts })
    }

    pub fn find(&self, address: &Address) -> Option<&Account> {
        self.accounts.iter().find(|a| a.address == *address)
    }

    /// Checksummed addresses, in registry order.
    pub fn addresses(&self) -> Vec<String> {
        self.accounts.iter().map(Account::checksum_address).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Account> {
        self.accounts.iter()
    }

    pub fn as_slice(&self) -> &[Account] {
        &self.accounts
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}
