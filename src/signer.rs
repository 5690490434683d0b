//! The on-chain transfer capability.
//!
//! The settlement engine hands a [`Signer`] the sender, recipient, token
//! mint, and an integer amount in minor units, and gets back a transaction
//! signature. [`SolanaSigner`] performs an SPL `transfer_checked` between
//! the associated token accounts of the two wallets, authorized and fee-paid
//! by the operator keypair. [`UnconfiguredSigner`] stands in when no keypair
//! is configured, so batches can still be completed manually through the
//! API.

use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use solana_signer::Signer as _;
use solana_transaction::Transaction;
use spl_associated_token_account::get_associated_token_address;
use std::str::FromStr;

/// USDC carries six decimal places on every supported deployment.
pub const USDC_DECIMALS: u8 = 6;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("Signer is not configured")]
    NotConfigured,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid token mint: {0}")]
    InvalidMint(String),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("Transaction error: {0}")]
    Transaction(String),
}

/// A capability that moves `amount` minor units of `mint` from `sender` to
/// `recipient` and returns the transaction signature.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn transfer(
        &self,
        sender: &str,
        recipient: &str,
        amount: u64,
        mint: &str,
    ) -> Result<String, SignerError>;
}

/// Settles batches on Solana via SPL token transfers.
///
/// The operator keypair is the transfer authority (a delegate over agent
/// token accounts) and the fee payer.
pub struct SolanaSigner {
    rpc_client: RpcClient,
    keypair: Keypair,
}

impl SolanaSigner {
    pub fn new(rpc_url: &str, keypair: Keypair) -> Self {
        let rpc_client =
            RpcClient::new_with_commitment(rpc_url.to_string(), CommitmentConfig::confirmed());
        Self { rpc_client, keypair }
    }

    pub fn operator_address(&self) -> String {
        self.keypair.pubkey().to_string()
    }
}

#[async_trait]
impl Signer for SolanaSigner {
    async fn transfer(
        &self,
        sender: &str,
        recipient: &str,
        amount: u64,
        mint: &str,
    ) -> Result<String, SignerError> {
        let sender = Pubkey::from_str(sender)
            .map_err(|_| SignerError::InvalidAddress(sender.to_string()))?;
        let recipient = Pubkey::from_str(recipient)
            .map_err(|_| SignerError::InvalidAddress(recipient.to_string()))?;
        let mint =
            Pubkey::from_str(mint).map_err(|_| SignerError::InvalidMint(mint.to_string()))?;

        let source = get_associated_token_address(&sender, &mint);
        let destination = get_associated_token_address(&recipient, &mint);
        let instruction = spl_token::instruction::transfer_checked(
            &spl_token::ID,
            &source,
            &mint,
            &destination,
            &self.keypair.pubkey(),
            &[],
            amount,
            USDC_DECIMALS,
        )
        .map_err(|e| SignerError::Transaction(e.to_string()))?;

        let blockhash = self
            .rpc_client
            .get_latest_blockhash()
            .await
            .map_err(|e| SignerError::Rpc(e.to_string()))?;
        let transaction = Transaction::new_signed_with_payer(
            &[instruction],
            Some(&self.keypair.pubkey()),
            &[&self.keypair],
            blockhash,
        );

        let signature = self
            .rpc_client
            .send_and_confirm_transaction(&transaction)
            .await
            .map_err(|e| SignerError::Transaction(e.to_string()))?;
        tracing::info!(tx = %signature, amount, "on-chain transfer confirmed");
        Ok(signature.to_string())
    }
}

/// Placeholder used when no operator keypair is configured. Every dispatch
/// fails, which leaves batches `failed` and retryable; operators settle via
/// `POST /batch/complete` instead.
pub struct UnconfiguredSigner;

#[async_trait]
impl Signer for UnconfiguredSigner {
    async fn transfer(
        &self,
        _sender: &str,
        _recipient: &str,
        _amount: u64,
        _mint: &str,
    ) -> Result<String, SignerError> {
        Err(SignerError::NotConfigured)
    }
}
