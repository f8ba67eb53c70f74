use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

pub mod amount;
pub mod chain;
pub mod consensus;
pub mod constants;
pub mod pow;
pub mod validate;

pub use amount::Amount;

pub type ChainId = Uuid;

/// Hex-encoded SHA-256 of `input`.
pub fn digest(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}

/// Current time truncated to microseconds, the precision the digest uses.
pub fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaxType {
    PersonalIncomeTax,
    CorporateIncomeTax,
    CapitalGainsTax,
    DividendTax,
    InterestIncomeTax,
    PropertyTax,
    VehicleTax,
    LuxuryTax,
    WealthTax,
    InheritanceTax,
    GiftTax,
    Vat,
    SalesTax,
    ExciseTax,
    ServiceTax,
    SinTax,
    FuelTax,
    CarbonTax,
    SugarTax,
    PayrollTax,
    SocialSecurityTax,
    MedicareTax,
    UnemploymentTax,
    WorkersCompensation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaxStatus {
    Filed,
    Paid,
    PartiallyPaid,
    Delinquent,
    UnderAudit,
    Disputed,
    Refunded,
}

/// Descriptive tax fields carried in a payload. They are hashed with the
/// rest of the transaction but never interpreted by consensus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaxDetails {
    pub kind: TaxType,
    pub jurisdiction: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub status: TaxStatus,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Transaction {
    pub id: Uuid,
    pub payer_id: String,
    pub amount: Amount,
    #[serde(default)]
    pub tax: Option<TaxDetails>,
}

impl Transaction {
    pub fn new(payer_id: impl Into<String>, amount: Amount) -> Self {
        Self {
            id: Uuid::new_v4(),
            payer_id: payer_id.into(),
            amount,
            tax: None,
        }
    }

    pub fn with_tax(mut self, tax: TaxDetails) -> Self {
        self.tax = Some(tax);
        self
    }
}

/// Canonical payload text used inside the block preimage.
impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.id, self.payer_id, self.amount)?;
        if let Some(tax) = &self.tax {
            write!(
                f,
                "|{:?}|{}|{}|{}|{:?}|{}",
                tax.kind,
                tax.jurisdiction,
                tax.period_start,
                tax.period_end,
                tax.status,
                tax.notes.as_deref().unwrap_or_default()
            )?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Blockchain {
    pub id: ChainId,
    pub name: String,
    pub reward_amount: Amount,
    pub difficulty: u32,
}

impl Blockchain {
    pub fn new(name: impl Into<String>, reward_amount: Amount, difficulty: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            reward_amount,
            difficulty,
        }
    }
}

/// The fixed parts of a block's canonical string; only the nonce varies
/// between mining attempts.
#[derive(Clone, Debug)]
pub struct Preimage {
    head: String,
    tail: String,
}

impl Preimage {
    pub fn digest(&self, nonce: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.head.as_bytes());
        hasher.update(nonce.to_string().as_bytes());
        hasher.update(self.tail.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Block {
    pub chain_id: ChainId,
    /// Empty for the genesis block.
    pub previous_hash: String,
    pub hash: String,
    pub nonce: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: Transaction,
}

impl Block {
    /// Unmined block on top of `previous_hash`, stamped with the current time.
    pub fn new(chain_id: ChainId, previous_hash: impl Into<String>, payload: Transaction) -> Self {
        let mut block = Self {
            chain_id,
            previous_hash: previous_hash.into(),
            hash: String::new(),
            nonce: 0,
            timestamp: now_micros(),
            payload,
        };
        block.hash = block.digest();
        block
    }

    pub fn preimage(&self) -> Preimage {
        Preimage {
            head: format!("{}-", self.previous_hash),
            tail: format!("-{}-{}", self.payload, self.timestamp.timestamp_micros()),
        }
    }

    /// Recompute the hash from the block's current contents.
    pub fn digest(&self) -> String {
        self.preimage().digest(self.nonce)
    }

    pub fn is_genesis(&self) -> bool {
        self.previous_hash.is_empty()
    }

    pub fn is_tampered(&self) -> bool {
        self.digest() != self.hash
    }

    pub fn meets_difficulty(&self, difficulty: u32) -> bool {
        pow::has_zero_prefix(&self.hash, difficulty)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.previous_hash,
            self.nonce,
            self.payload,
            self.timestamp.timestamp_micros()
        )
    }
}
