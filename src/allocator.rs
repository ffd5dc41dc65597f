//! Deposit address allocation
//!
//! One address per (user, chain). Every EVM-family chain reuses the user's
//! earliest EVM address; Solana has its own index space. Fresh indexes are
//! `max + 1` over the family, so allocations are serialized in-process.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core_types::{Chain, ChainFamily, DerivationIndex, UserId};
use crate::error::CustodyError;
use crate::keys::SigningProvider;
use crate::keys::hd::HARDENED;
use crate::ledger::{DepositAddress, LedgerError, LedgerStore, NewDepositAddress};
use crate::scheduler::Clock;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocatedAddress {
    pub chain: Chain,
    pub address: String,
    pub derivation_index: DerivationIndex,
    pub is_new: bool,
}

pub struct AddressAllocator {
    ledger: Arc<dyn LedgerStore>,
    signer: Arc<dyn SigningProvider>,
    clock: Arc<dyn Clock>,
    alloc_lock: Mutex<()>,
}

impl AddressAllocator {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        signer: Arc<dyn SigningProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            signer,
            clock,
            alloc_lock: Mutex::new(()),
        }
    }

    pub async fn get_deposit_address(
        &self,
        user_id: UserId,
        chain: Chain,
    ) -> Result<AllocatedAddress, CustodyError> {
        if let Some(existing) = self.ledger.find_deposit_address(user_id, chain).await? {
            return Ok(allocated(existing, false));
        }

        let _guard = self.alloc_lock.lock().await;
        // Re-check under the lock: a concurrent call may have just created it
        if let Some(existing) = self.ledger.find_deposit_address(user_id, chain).await? {
            return Ok(allocated(existing, false));
        }

        let family = chain.family();
        let (address, derivation_index) = match self.canonical_evm(user_id, family).await? {
            Some(canonical) => {
                tracing::debug!(
                    user_id,
                    chain = %chain,
                    address = %canonical.address,
                    "Reusing canonical EVM address"
                );
                (canonical.address, canonical.derivation_index)
            }
            None => {
                let index = self.next_index(family).await?;
                let address = self.signer.deposit_address(family, index)?;
                (address, index)
            }
        };

        let row = self
            .ledger
            .insert_deposit_address(
                NewDepositAddress {
                    user_id,
                    chain,
                    address,
                    derivation_index,
                },
                self.clock.now(),
            )
            .await?;

        tracing::info!(
            user_id,
            chain = %chain,
            address = %row.address,
            derivation_index = row.derivation_index,
            "Allocated deposit address"
        );
        Ok(allocated(row, true))
    }

    pub async fn get_user_deposit_addresses(
        &self,
        user_id: UserId,
    ) -> Result<Vec<DepositAddress>, CustodyError> {
        Ok(self.ledger.user_addresses(user_id).await?)
    }

    /// Rewrite every EVM-family row that diverges from the user's earliest
    /// EVM address. Returns the number of rows repaired.
    pub async fn ensure_evm_address_consistency(
        &self,
        user_id: UserId,
    ) -> Result<usize, CustodyError> {
        let _guard = self.alloc_lock.lock().await;
        let Some(canonical) = self.canonical_evm(user_id, ChainFamily::Evm).await? else {
            return Ok(0);
        };

        let mut repaired = 0;
        for row in self.ledger.user_addresses(user_id).await? {
            if !row.chain.is_evm() || row.id == canonical.id {
                continue;
            }
            if row.address == canonical.address && row.derivation_index == canonical.derivation_index
            {
                continue;
            }
            tracing::warn!(
                user_id,
                chain = %row.chain,
                from = %row.address,
                to = %canonical.address,
                "Repairing divergent EVM deposit address"
            );
            self.ledger
                .repoint_deposit_address(row.id, &canonical.address, canonical.derivation_index)
                .await?;
            repaired += 1;
        }
        Ok(repaired)
    }

    async fn canonical_evm(
        &self,
        user_id: UserId,
        family: ChainFamily,
    ) -> Result<Option<DepositAddress>, CustodyError> {
        if family != ChainFamily::Evm {
            return Ok(None);
        }
        // user_addresses is ordered oldest first
        Ok(self
            .ledger
            .user_addresses(user_id)
            .await?
            .into_iter()
            .find(|a| a.chain.is_evm()))
    }

    /// Indexes stay below the hardened bit; past it Solana paths would
    /// alias lower indexes
    async fn next_index(&self, family: ChainFamily) -> Result<DerivationIndex, CustodyError> {
        match self.ledger.max_derivation_index(family).await? {
            None => Ok(0),
            Some(max) => max
                .checked_add(1)
                .filter(|next| *next < HARDENED)
                .ok_or_else(|| {
                    CustodyError::Ledger(LedgerError::Invariant(format!(
                        "{} derivation index space exhausted at {}",
                        family, max
                    )))
                }),
        }
    }
}

fn allocated(row: DepositAddress, is_new: bool) -> AllocatedAddress {
    AllocatedAddress {
        chain: row.chain,
        address: row.address,
        derivation_index: row.derivation_index,
        is_new,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{HdSigningProvider, MasterSeed};
    use crate::ledger::{AddressStore, MemoryLedger};
    use crate::scheduler::ManualClock;
    use chrono::{Duration as ChronoDuration, Utc};

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        clock: Arc<ManualClock>,
        allocator: AddressAllocator,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let signer = Arc::new(HdSigningProvider::new(
            MasterSeed::from_hex("000102030405060708090a0b0c0d0e0f").unwrap(),
        ));
        let allocator = AddressAllocator::new(ledger.clone(), signer, clock.clone());
        Fixture {
            ledger,
            clock,
            allocator,
        }
    }

    #[tokio::test]
    async fn test_existing_address_returned_unchanged() {
        let f = fixture();
        let first = f.allocator.get_deposit_address(1, Chain::Base).await.unwrap();
        assert!(first.is_new);
        let again = f.allocator.get_deposit_address(1, Chain::Base).await.unwrap();
        assert!(!again.is_new);
        assert_eq!(first.address, again.address);
    }

    #[tokio::test]
    async fn test_index_space_exhaustion_is_ledger_error() {
        let f = fixture();
        f.ledger
            .insert_deposit_address(
                NewDepositAddress {
                    user_id: 99,
                    chain: Chain::Solana,
                    address: "last".to_string(),
                    derivation_index: HARDENED - 1,
                },
                f.clock.now(),
            )
            .await
            .unwrap();

        let err = f
            .allocator
            .get_deposit_address(1, Chain::Solana)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LEDGER_ERROR");
        assert!(err.to_string().contains("exhausted"));
        // the EVM tree is unaffected
        assert!(f.allocator.get_deposit_address(1, Chain::Base).await.is_ok());
    }

    #[tokio::test]
    async fn test_evm_chains_share_address() {
        let f = fixture();
        let mut addrs = Vec::new();
        for chain in Chain::evm_chains() {
            f.clock.advance(ChronoDuration::seconds(1));
            addrs.push(f.allocator.get_deposit_address(7, chain).await.unwrap());
        }
        assert!(addrs.windows(2).all(|w| w[0].address == w[1].address));
        assert!(addrs.iter().all(|a| a.derivation_index == addrs[0].derivation_index));
        assert!(addrs.iter().all(|a| a.is_new));
    }

    #[tokio::test]
    async fn test_solana_independent_index_space() {
        let f = fixture();
        let u1_evm = f.allocator.get_deposit_address(1, Chain::Ethereum).await.unwrap();
        let u2_evm = f.allocator.get_deposit_address(2, Chain::Ethereum).await.unwrap();
        let u1_sol = f.allocator.get_deposit_address(1, Chain::Solana).await.unwrap();
        let u2_sol = f.allocator.get_deposit_address(2, Chain::Solana).await.unwrap();

        assert_eq!(u1_evm.derivation_index, 0);
        assert_eq!(u2_evm.derivation_index, 1);
        assert_eq!(u1_sol.derivation_index, 0);
        assert_eq!(u2_sol.derivation_index, 1);
        assert_ne!(u1_sol.address, u1_evm.address);
        assert!(!u1_sol.address.starts_with("0x"));
    }

    #[tokio::test]
    async fn test_consistency_repair_is_idempotent() {
        let f = fixture();
        let eth = f.allocator.get_deposit_address(3, Chain::Ethereum).await.unwrap();
        f.clock.advance(ChronoDuration::seconds(1));
        let base = f.allocator.get_deposit_address(3, Chain::Base).await.unwrap();
        let base_row = f
            .ledger
            .find_deposit_address(3, Chain::Base)
            .await
            .unwrap()
            .unwrap();
        f.ledger
            .repoint_deposit_address(base_row.id, "0xdeadbeef", 99)
            .await
            .unwrap();

        assert_eq!(f.allocator.ensure_evm_address_consistency(3).await.unwrap(), 1);
        assert_eq!(f.allocator.ensure_evm_address_consistency(3).await.unwrap(), 0);

        let repaired = f.allocator.get_deposit_address(3, Chain::Base).await.unwrap();
        assert_eq!(repaired.address, eth.address);
        assert_eq!(repaired.address, base.address);
        assert_eq!(repaired.derivation_index, eth.derivation_index);
    }

    #[tokio::test]
    async fn test_user_addresses_listed_oldest_first() {
        let f = fixture();
        f.allocator.get_deposit_address(5, Chain::Solana).await.unwrap();
        f.clock.advance(ChronoDuration::seconds(1));
        f.allocator.get_deposit_address(5, Chain::Polygon).await.unwrap();
        let rows = f.allocator.get_user_deposit_addresses(5).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].chain, Chain::Solana);
        assert_eq!(rows[1].chain, Chain::Polygon);
    }
}
