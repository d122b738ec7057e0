// Production chain adapter: ethers websocket provider + signer middleware
// over the room-shares contract. Revert classification is selector-first,
// with lowercase substring matching as the fallback for opaque provider
// messages.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::abi::AbiDecode;
use ethers::contract::{abigen, ContractError};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Middleware, Provider, Ws};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Selector, U256};
use ethers::utils::id;
use futures::StreamExt;
use lazy_static::lazy_static;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::chain::{SharesChain, TradeEvent, TradeStream, TxConfirmation};
use crate::config::Config;
use crate::error::ChainError;

abigen!(
    RoomShares,
    r#"[
        function buyShares(address subject, uint256 amount, uint256 curveIndex) payable
        function sellShares(address subject, uint256 amount)
        function getBuyPriceAfterFee(address subject, uint256 amount, uint256 curveIndex) view returns (uint256)
        function sharesBalance(address subject, address holder) view returns (uint256)
        event Trade(address trader, address subject, bool isBuy, uint256 shareAmount, uint256 ethAmount, uint256 supply, uint256 multiplier)
    ]"#
);

type WsClient = SignerMiddleware<Provider<Ws>, LocalWallet>;

lazy_static! {
    static ref SEL_LAST_SHARE: Selector = id("LastShareCannotBeSold()");
    static ref SEL_INSUFFICIENT_SHARES: Selector = id("InsufficientShares()");
    static ref SEL_INSUFFICIENT_PAYMENT: Selector = id("InsufficientPayment()");
    static ref SEL_ERROR_STRING: Selector = id("Error(string)");
}

pub struct EvmSharesClient {
    client: Arc<WsClient>,
    contract: RoomShares<WsClient>,
    fee_multiplier_pct: u64,
}

impl EvmSharesClient {
    pub async fn connect(config: &Config) -> Result<Self> {
        let provider = Provider::<Ws>::connect(&config.rpc_ws_url)
            .await
            .context("Failed to connect websocket provider")?;

        let wallet: LocalWallet = config
            .wallet_private_key
            .parse()
            .context("Failed to parse wallet private key")?;
        let wallet = wallet.with_chain_id(config.chain_id);

        let contract_address: Address = config
            .contract_address
            .parse()
            .context("Failed to parse shares contract address")?;

        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let contract = RoomShares::new(contract_address, client.clone());

        Ok(Self {
            client,
            contract,
            fee_multiplier_pct: config.fee_multiplier_pct,
        })
    }

    /// Network-suggested EIP-1559 fees scaled by the configured multiplier.
    /// The max fee is floored at the priority fee so the pair stays valid.
    async fn scaled_fees(&self) -> Result<(U256, U256), ChainError> {
        let (max_fee, priority_fee) = self
            .client
            .estimate_eip1559_fees(None)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        let scaled = max_fee * U256::from(self.fee_multiplier_pct) / U256::from(100u64);
        Ok((scaled.max(priority_fee), priority_fee))
    }

    fn apply_fees(tx: &mut TypedTransaction, max_fee: U256, priority_fee: U256) {
        if let TypedTransaction::Eip1559(inner) = tx {
            inner.max_fee_per_gas = Some(max_fee);
            inner.max_priority_fee_per_gas = Some(priority_fee);
        }
    }

    async fn await_confirmation(
        &self,
        pending: ethers::providers::PendingTransaction<'_, Ws>,
    ) -> Result<TxConfirmation, ChainError> {
        let receipt = pending
            .confirmations(1)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?
            .ok_or(ChainError::Dropped)?;

        if receipt.status != Some(1u64.into()) {
            return Err(ChainError::RolledBack(format!(
                "{:#x}",
                receipt.transaction_hash
            )));
        }

        Ok(TxConfirmation {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|b| b.as_u64()).unwrap_or(0),
            gas_used: receipt.gas_used.map(|g| g.low_u64()),
        })
    }
}

/// Classify revert data by custom-error selector, falling back to the
/// provider's message text when the data is absent or unrecognized.
fn classify_revert(data: Option<&Bytes>, message: &str) -> ChainError {
    if let Some(data) = data {
        if data.len() >= 4 {
            let mut selector = [0u8; 4];
            selector.copy_from_slice(&data[..4]);
            if selector == *SEL_LAST_SHARE {
                return ChainError::LastShareUnsellable;
            }
            if selector == *SEL_INSUFFICIENT_SHARES {
                return ChainError::InsufficientShares;
            }
            if selector == *SEL_INSUFFICIENT_PAYMENT {
                return ChainError::InsufficientFunds;
            }
            if selector == *SEL_ERROR_STRING {
                if let Ok(reason) = String::decode(&data[4..]) {
                    return classify_message(&reason);
                }
            }
        }
    }
    classify_message(message)
}

fn classify_message(message: &str) -> ChainError {
    let lower = message.to_lowercase();
    if lower.contains("cannot sell the last share") {
        ChainError::LastShareUnsellable
    } else if lower.contains("insufficient shares") {
        ChainError::InsufficientShares
    } else if lower.contains("insufficient funds") {
        ChainError::InsufficientFunds
    } else {
        ChainError::Reverted(message.to_string())
    }
}

fn classify_contract_error<M: Middleware>(err: ContractError<M>) -> ChainError {
    let message = err.to_string();
    classify_revert(err.as_revert(), &message)
}

#[async_trait]
impl SharesChain for EvmSharesClient {
    async fn buy_price_after_fee(
        &self,
        subject: Address,
        amount: u64,
        curve_index: u8,
    ) -> Result<U256, ChainError> {
        self.contract
            .get_buy_price_after_fee(subject, U256::from(amount), U256::from(curve_index))
            .call()
            .await
            .map_err(classify_contract_error)
    }

    async fn shares_balance(&self, subject: Address) -> Result<u64, ChainError> {
        let balance = self
            .contract
            .shares_balance(subject, self.wallet_address())
            .call()
            .await
            .map_err(classify_contract_error)?;
        Ok(balance.low_u64())
    }

    async fn estimate_sell(&self, subject: Address, amount: u64) -> Result<(), ChainError> {
        self.contract
            .sell_shares(subject, U256::from(amount))
            .estimate_gas()
            .await
            .map(|_| ())
            .map_err(classify_contract_error)
    }

    async fn submit_buy(
        &self,
        subject: Address,
        amount: u64,
        curve_index: u8,
    ) -> Result<TxConfirmation, ChainError> {
        let price = self
            .buy_price_after_fee(subject, amount, curve_index)
            .await?;
        debug!("Buy price for {:#x} x{}: {} wei", subject, amount, price);

        let mut call = self
            .contract
            .buy_shares(subject, U256::from(amount), U256::from(curve_index))
            .value(price);

        let (max_fee, priority_fee) = self.scaled_fees().await?;
        Self::apply_fees(&mut call.tx, max_fee, priority_fee);

        let pending = call.send().await.map_err(classify_contract_error)?;
        self.await_confirmation(pending).await
    }

    async fn submit_sell(
        &self,
        subject: Address,
        amount: u64,
        gas_limit: Option<u64>,
    ) -> Result<TxConfirmation, ChainError> {
        let mut call = self.contract.sell_shares(subject, U256::from(amount));
        if let Some(limit) = gas_limit {
            call = call.gas(limit);
        }

        let (max_fee, priority_fee) = self.scaled_fees().await?;
        Self::apply_fees(&mut call.tx, max_fee, priority_fee);

        let pending = call.send().await.map_err(classify_contract_error)?;
        self.await_confirmation(pending).await
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.client
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    async fn subscribe_trades(&self) -> Result<TradeStream, ChainError> {
        // The ethers event stream borrows the contract, so a forwarding task
        // owns a clone and feeds a channel we can hand out as 'static.
        let contract = self.contract.clone();
        let (tx, rx) = mpsc::channel::<Result<TradeEvent, ChainError>>(256);

        tokio::spawn(async move {
            let event = contract.event::<TradeFilter>();
            match event.subscribe_with_meta().await {
                Ok(mut stream) => {
                    while let Some(item) = stream.next().await {
                        let mapped = match item {
                            Ok((ev, meta)) => Ok(TradeEvent {
                                trader: ev.trader,
                                subject: ev.subject,
                                is_buy: ev.is_buy,
                                share_amount: ev.share_amount,
                                eth_amount: ev.eth_amount,
                                supply: ev.supply,
                                multiplier: ev.multiplier,
                                tx_hash: meta.transaction_hash,
                                log_index: meta.log_index.low_u64(),
                                block_number: meta.block_number.as_u64(),
                            }),
                            Err(e) => Err(ChainError::Rpc(e.to_string())),
                        };
                        if tx.send(mapped).await.is_err() {
                            debug!("Trade stream receiver dropped, ending forwarder");
                            return;
                        }
                    }
                    warn!("Trade event stream ended");
                    let _ = tx
                        .send(Err(ChainError::Rpc("event stream ended".to_string())))
                        .await;
                }
                Err(e) => {
                    let _ = tx.send(Err(ChainError::Rpc(e.to_string()))).await;
                }
            };
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }

    fn wallet_address(&self) -> Address {
        self.client.signer().address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_classification_beats_string_matching() {
        let mut data = SEL_LAST_SHARE.to_vec();
        data.extend_from_slice(&[0u8; 8]);
        let err = classify_revert(Some(&Bytes::from(data)), "execution reverted");
        assert!(matches!(err, ChainError::LastShareUnsellable));

        let err = classify_revert(
            Some(&Bytes::from(SEL_INSUFFICIENT_SHARES.to_vec())),
            "execution reverted",
        );
        assert!(matches!(err, ChainError::InsufficientShares));
    }

    #[test]
    fn error_string_selector_decodes_and_reclassifies() {
        use ethers::abi::AbiEncode;
        let mut data = SEL_ERROR_STRING.to_vec();
        data.extend_from_slice(&"Cannot sell the last share".to_string().encode());
        let err = classify_revert(Some(&Bytes::from(data)), "execution reverted");
        assert!(matches!(err, ChainError::LastShareUnsellable));
    }

    #[test]
    fn message_fallback_covers_known_reasons() {
        assert!(matches!(
            classify_message("execution reverted: Cannot sell the last share"),
            ChainError::LastShareUnsellable
        ));
        assert!(matches!(
            classify_message("execution reverted: Insufficient shares"),
            ChainError::InsufficientShares
        ));
        assert!(matches!(
            classify_message("insufficient funds for gas * price + value"),
            ChainError::InsufficientFunds
        ));
        assert!(matches!(
            classify_message("execution reverted: Paused"),
            ChainError::Reverted(_)
        ));
    }

    #[test]
    fn unknown_selector_falls_back_to_message() {
        let data = Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]);
        let err = classify_revert(Some(&data), "execution reverted: Paused");
        assert!(matches!(err, ChainError::Reverted(_)));
    }
}
