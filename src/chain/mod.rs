// Chain adapter boundary. The trading core talks to the shares contract
// through the `SharesChain` trait; the production implementation lives in
// `shares.rs`, tests inject their own.

pub mod shares;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use futures::stream::BoxStream;

use crate::error::ChainError;

pub use shares::EvmSharesClient;

/// One decoded Trade event from the contract, with its on-chain identifiers.
#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub trader: Address,
    pub subject: Address,
    pub is_buy: bool,
    pub share_amount: U256,
    pub eth_amount: U256,
    /// Circulating supply of the subject's shares after this trade.
    pub supply: U256,
    pub multiplier: U256,
    pub tx_hash: H256,
    pub log_index: u64,
    pub block_number: u64,
}

impl TradeEvent {
    /// A buy that takes the supply to exactly one is the creation trade.
    pub fn is_new_token(&self) -> bool {
        self.is_buy && self.supply == U256::one()
    }

    pub fn is_creator_sell(&self) -> bool {
        !self.is_buy && self.trader == self.subject
    }
}

/// Receipt fields of a transaction confirmed at depth one.
#[derive(Debug, Clone)]
pub struct TxConfirmation {
    pub tx_hash: H256,
    pub block_number: u64,
    pub gas_used: Option<u64>,
}

pub type TradeStream = BoxStream<'static, Result<TradeEvent, ChainError>>;

/// Everything the trading core needs from the chain: reads, serialized
/// submissions awaited to one confirmation, and the live event stream.
#[async_trait]
pub trait SharesChain: Send + Sync {
    /// Price in wei to buy `amount` shares on the given curve, fees included.
    async fn buy_price_after_fee(
        &self,
        subject: Address,
        amount: u64,
        curve_index: u8,
    ) -> Result<U256, ChainError>;

    /// Our wallet's on-chain share balance for the subject.
    async fn shares_balance(&self, subject: Address) -> Result<u64, ChainError>;

    /// Dry-run a sell. Classified revert reasons come back as typed errors.
    async fn estimate_sell(&self, subject: Address, amount: u64) -> Result<(), ChainError>;

    async fn submit_buy(
        &self,
        subject: Address,
        amount: u64,
        curve_index: u8,
    ) -> Result<TxConfirmation, ChainError>;

    /// `gas_limit` overrides estimation when the caller already knows
    /// estimation fails for an unclassified reason.
    async fn submit_sell(
        &self,
        subject: Address,
        amount: u64,
        gas_limit: Option<u64>,
    ) -> Result<TxConfirmation, ChainError>;

    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Live subscription to the contract's Trade events.
    async fn subscribe_trades(&self) -> Result<TradeStream, ChainError>;

    fn wallet_address(&self) -> Address;
}
