//! Method dispatch table.

/// Methods the gateway treats specially. Everything else is forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    SendRawTransaction,
    SendBatchRawTransaction,
    Get0GweiGasRemaining,
    GasPrice,
    ChainId,
    ClientVersion,
    Call,
    TxCount,
    WalletCount,
    WalletList,
}

/// Per-host statistics kept by the transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatQuery {
    /// Transactions submitted through the host
    TxCount,
    /// Distinct sender wallets seen on the host
    WalletCount,
    /// Those wallets
    WalletList,
}

/// How a locally answerable method is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalAnswer {
    GasPrice,
    ChainId,
    ClientVersion,
    Stats(StatQuery),
}

/// Disposition of one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodSpec {
    /// Answered by the gateway for singleton requests on RPC hosts
    pub local: Option<LocalAnswer>,
    /// Any occurrence routes the whole request to the sentry
    pub forces_sentry: bool,
    /// Subject to the `eth_call` probe rule
    pub counts_as_eth_call: bool,
}

const ALL: [RpcMethod; 10] = [
    RpcMethod::SendRawTransaction,
    RpcMethod::SendBatchRawTransaction,
    RpcMethod::Get0GweiGasRemaining,
    RpcMethod::GasPrice,
    RpcMethod::ChainId,
    RpcMethod::ClientVersion,
    RpcMethod::Call,
    RpcMethod::TxCount,
    RpcMethod::WalletCount,
    RpcMethod::WalletList,
];

impl RpcMethod {
    pub fn from_name(name: &str) -> Option<Self> {
        ALL.iter().copied().find(|m| m.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RpcMethod::SendRawTransaction => "eth_sendRawTransaction",
            RpcMethod::SendBatchRawTransaction => "eth_sendBatchRawTransaction",
            RpcMethod::Get0GweiGasRemaining => "eth_get0GweiGasRemaining",
            RpcMethod::GasPrice => "eth_gasPrice",
            RpcMethod::ChainId => "eth_chainId",
            RpcMethod::ClientVersion => "web3_clientVersion",
            RpcMethod::Call => "eth_call",
            RpcMethod::TxCount => "gate_txCount",
            RpcMethod::WalletCount => "gate_walletCount",
            RpcMethod::WalletList => "gate_walletList",
        }
    }

    pub fn spec(&self) -> MethodSpec {
        match self {
            RpcMethod::SendRawTransaction
            | RpcMethod::SendBatchRawTransaction
            | RpcMethod::Get0GweiGasRemaining => MethodSpec {
                forces_sentry: true,
                ..MethodSpec::default()
            },
            RpcMethod::GasPrice => local(LocalAnswer::GasPrice),
            RpcMethod::ChainId => local(LocalAnswer::ChainId),
            RpcMethod::ClientVersion => local(LocalAnswer::ClientVersion),
            RpcMethod::TxCount => local(LocalAnswer::Stats(StatQuery::TxCount)),
            RpcMethod::WalletCount => local(LocalAnswer::Stats(StatQuery::WalletCount)),
            RpcMethod::WalletList => local(LocalAnswer::Stats(StatQuery::WalletList)),
            RpcMethod::Call => MethodSpec {
                counts_as_eth_call: true,
                ..MethodSpec::default()
            },
        }
    }

    /// Whether the raw parameters carry signed transactions.
    pub fn submits_transactions(&self) -> bool {
        matches!(
            self,
            RpcMethod::SendRawTransaction | RpcMethod::SendBatchRawTransaction
        )
    }
}

fn local(answer: LocalAnswer) -> MethodSpec {
    MethodSpec {
        local: Some(answer),
        ..MethodSpec::default()
    }
}
