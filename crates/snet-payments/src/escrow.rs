use crate::error::PaymentError;
use crate::ledger::{FundingOperation, FundingReceipt, Ledger};
use crate::units::{Address, Cogs};

/// Brings the payer's escrow to at least `required`, depositing up to
/// `target` and approving the token allowance first when it falls short.
///
/// Returns no receipts when the escrow already covers `required`.
pub async fn top_up_escrow(
    ledger: &dyn Ledger,
    owner: &Address,
    required: Cogs,
    target: Cogs,
) -> Result<Vec<FundingReceipt>, PaymentError> {
    let balance = ledger.escrow_balance(owner).await?;
    if balance >= required {
        return Ok(Vec::new());
    }

    let deposit = target.max(required).saturating_sub(balance);
    let mut receipts = Vec::with_capacity(2);
    let allowance = ledger.token_allowance(owner).await?;
    if allowance < deposit {
        tracing::info!(owner = %owner, amount_cogs = %deposit, "approving escrow allowance");
        let receipt = ledger.approve_escrow(deposit).await?;
        receipts.push(FundingReceipt::new(FundingOperation::ApproveEscrow, receipt));
    }

    tracing::info!(
        owner = %owner,
        balance_cogs = %balance,
        amount_cogs = %deposit,
        "depositing to escrow"
    );
    let receipt = ledger.deposit_to_escrow(deposit).await?;
    receipts.push(FundingReceipt::new(FundingOperation::DepositToEscrow, receipt));
    Ok(receipts)
}
