use std::collections::HashMap;

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, B256, Bytes, I256, U256, address, keccak256};
use async_trait::async_trait;
use futures::stream;
use serde_json::{Value, json};
use uuid::Uuid;

use rewards_indexer::indexer::registry::{EventRegistry, FamilyRegistry};
use rewards_indexer::indexer::rpc::{ChainClient, ChainTransaction, LogStream};
use rewards_indexer::models::common::{EventFamily, PipelineConfig, SenderPolicy};
use rewards_indexer::models::datasets::logs::{ContractRef, EventDefinition, RawLog};
use rewards_indexer::models::errors::{ClientError, LogError};
use rewards_indexer::{ACTION_POINTS, UNRESOLVED_SENDER, process_logs};

const TOKEN: Address = address!("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
const POOL: Address = address!("0x88e6a0c2ddd26feeb64f039a2c41296fcb3f5640");
const ALICE: Address = address!("0x00000000000000000000000000000000000a11ce");
const BOB: Address = address!("0x0000000000000000000000000000000000000b0b");
const SENDER: Address = address!("0x52908400098527886e0f7030069857d2e4169ee7");
const BLOCK_HASH: B256 = B256::repeat_byte(0x01);

//////// Scripted chain client ////////
#[derive(Clone)]
enum Lookup {
    Mined(Address),
    Pending,
    LookupFails,
    SenderFails,
}

#[derive(Default)]
struct FakeChainClient {
    lookups: HashMap<B256, Lookup>,
}

impl FakeChainClient {
    fn with(mut self, transaction_hash: B256, lookup: Lookup) -> Self {
        self.lookups.insert(transaction_hash, lookup);
        self
    }
}

fn network_error(method: &'static str) -> ClientError {
    ClientError::Network {
        method,
        message: "connection reset by peer".to_string(),
    }
}

#[async_trait]
impl ChainClient for FakeChainClient {
    async fn latest_block_number(&self) -> Result<u64, ClientError> {
        Ok(1_000)
    }

    async fn filter_logs(
        &self,
        _address: Address,
        _from_block: u64,
        _to_block: u64,
    ) -> Result<Vec<RawLog>, ClientError> {
        Ok(vec![])
    }

    async fn transaction_by_hash(
        &self,
        hash: B256,
    ) -> Result<(ChainTransaction, bool), ClientError> {
        // Unscripted transactions were sent by SENDER
        let lookup = self
            .lookups
            .get(&hash)
            .cloned()
            .unwrap_or(Lookup::Mined(SENDER));
        let mined = |from| ChainTransaction {
            hash,
            from,
            block_hash: Some(BLOCK_HASH),
            block_number: Some(100),
            transaction_index: Some(0),
        };
        match lookup {
            Lookup::Mined(from) => Ok((mined(from), false)),
            Lookup::SenderFails => Ok((mined(Address::ZERO), false)),
            Lookup::Pending => Ok((
                ChainTransaction {
                    hash,
                    from: Address::ZERO,
                    block_hash: None,
                    block_number: None,
                    transaction_index: None,
                },
                true,
            )),
            Lookup::LookupFails => Err(network_error("transaction_by_hash")),
        }
    }

    async fn transaction_sender(
        &self,
        transaction: &ChainTransaction,
        _block_hash: Option<B256>,
        _transaction_index: Option<u64>,
    ) -> Result<Address, ClientError> {
        match self.lookups.get(&transaction.hash) {
            Some(Lookup::SenderFails) => Err(network_error("transaction_sender")),
            _ => Ok(transaction.from),
        }
    }

    async fn subscribe_logs(&self, _address: Address) -> Result<LogStream, ClientError> {
        Ok(Box::pin(stream::empty()))
    }

    async fn is_contract(&self, _address: Address) -> Result<bool, ClientError> {
        Ok(true)
    }
}

//////// Fixtures ////////
fn registry() -> &'static EventRegistry {
    EventRegistry::global().expect("embedded ABIs are valid")
}

fn family(family: EventFamily) -> &'static FamilyRegistry {
    registry().family(family).expect("family is registered")
}

fn selector(family_id: EventFamily, event: &str) -> B256 {
    family(family_id).shape(event).expect("event is registered").selector
}

fn definitions(address: Address, family_id: EventFamily, events: &[&str]) -> Vec<EventDefinition> {
    let contract = ContractRef {
        id: Uuid::now_v7(),
        address,
        family: family_id,
    };
    events
        .iter()
        .map(|event| EventDefinition {
            id: Uuid::now_v7(),
            contract: contract.clone(),
            name: event.to_string(),
            signature: selector(family_id, event),
        })
        .collect()
}

fn tx_hash(n: u64) -> B256 {
    B256::from(U256::from(n))
}

fn raw_log(address: Address, topics: Vec<B256>, data: Vec<u8>, n: u64) -> RawLog {
    RawLog {
        address,
        topics,
        data: Bytes::from(data),
        block_number: 100,
        block_hash: Some(BLOCK_HASH),
        transaction_hash: tx_hash(n),
        transaction_index: Some(0),
        log_index: n,
    }
}

fn transfer_log(n: u64, value: u64) -> RawLog {
    raw_log(
        TOKEN,
        vec![
            selector(EventFamily::Erc20, "Transfer"),
            ALICE.into_word(),
            BOB.into_word(),
        ],
        U256::from(value).to_be_bytes::<32>().to_vec(),
        n,
    )
}

fn formatted(data: &str) -> Value {
    let envelope: Value = serde_json::from_str(data).expect("data is JSON");
    assert_eq!(envelope.as_object().map(|o| o.len()), Some(2));
    envelope["formatted"].clone()
}

fn lower(value: &Value) -> String {
    value.as_str().unwrap_or_default().to_lowercase()
}

//////// Scenarios ////////
#[tokio::test]
async fn test_transfer_is_decoded_and_normalized() {
    let client = FakeChainClient::default();
    let definitions = definitions(TOKEN, EventFamily::Erc20, &["Transfer", "Approval"]);
    let log = transfer_log(1, 1000);

    let batch = process_logs(
        &client,
        family(EventFamily::Erc20),
        &[log.clone()],
        &definitions,
        &PipelineConfig::default(),
        None,
    )
    .await;

    assert!(batch.diagnostics.is_empty());
    assert_eq!(batch.event_logs.len(), 1);
    let record = &batch.event_logs[0];
    assert_eq!(record.contract_address, TOKEN);
    assert_eq!(record.contract_event_id, definitions[0].id);
    assert_eq!(record.contract_id, definitions[0].contract.id);
    assert_eq!(record.block_number, 100);

    let fields = formatted(&record.data);
    assert_eq!(lower(&fields["from"]), format!("{:#x}", ALICE));
    assert_eq!(lower(&fields["to"]), format!("{:#x}", BOB));
    assert_eq!(fields["value"], json!("1000"));

    let envelope: Value = serde_json::from_str(&record.data).unwrap();
    assert_eq!(envelope["raw"], json!(alloy_primitives::hex::encode(&log.data)));

    let topics: Vec<B256> = serde_json::from_str(&record.topics).unwrap();
    assert_eq!(topics, log.topics);

    let actions = &batch.user_actions[&SENDER.to_checksum(None)];
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action, "Transfer");
    assert_eq!(actions[0].event_log_id, record.id);
    assert_eq!(actions[0].transaction_hash, record.transaction_hash);
    assert_eq!(actions[0].point, ACTION_POINTS);
}

#[tokio::test]
async fn test_swap_fields_match_payload_and_topics() {
    let client = FakeChainClient::default();
    let definitions = definitions(POOL, EventFamily::PoolSwap, &["Swap"]);
    let sqrt_price = U256::from(1_771_595_571_142_957_166_518_320_255_467_520u128);
    let liquidity = U256::from(22_402_462_192_838_616u128);
    let data = DynSolValue::Tuple(vec![
        DynSolValue::Int(I256::try_from(100i64).unwrap(), 256),
        DynSolValue::Int(I256::try_from(-50i64).unwrap(), 256),
        DynSolValue::Uint(sqrt_price, 160),
        DynSolValue::Uint(liquidity, 128),
        DynSolValue::Int(I256::try_from(-201_240i64).unwrap(), 24),
    ])
    .abi_encode_params();
    let log = raw_log(
        POOL,
        vec![
            keccak256("Swap(address,address,int256,int256,uint160,uint128,int24)"),
            ALICE.into_word(),
            BOB.into_word(),
        ],
        data,
        7,
    );

    let batch = process_logs(
        &client,
        family(EventFamily::PoolSwap),
        &[log],
        &definitions,
        &PipelineConfig::default(),
        None,
    )
    .await;

    assert_eq!(batch.event_logs.len(), 1);
    let fields = formatted(&batch.event_logs[0].data);
    assert_eq!(lower(&fields["sender"]), format!("{:#x}", ALICE));
    assert_eq!(lower(&fields["recipient"]), format!("{:#x}", BOB));
    assert_eq!(fields["amount0"], json!("100"));
    assert_eq!(fields["amount1"], json!("-50"));
    assert_eq!(fields["sqrtPriceX96"], json!(sqrt_price.to_string()));
    assert_eq!(fields["liquidity"], json!(liquidity.to_string()));
    assert_eq!(fields["tick"], json!("-201240"));
}

#[tokio::test]
async fn test_bridge_sent_overlays_recipient_from_topic() {
    let client = FakeChainClient::default();
    let definitions = definitions(TOKEN, EventFamily::Bridge, &["SentTokens", "FulfilledTokens"]);
    let data = DynSolValue::Tuple(vec![
        DynSolValue::Address(ALICE),
        DynSolValue::String("ethereum".to_string()),
        DynSolValue::String("arbitrum".to_string()),
        DynSolValue::Uint(U256::from(5_000u64), 256),
        DynSolValue::Uint(U256::from(2u64), 256),
    ])
    .abi_encode_params();
    let log = raw_log(
        TOKEN,
        vec![selector(EventFamily::Bridge, "SentTokens"), BOB.into_word()],
        data,
        3,
    );

    let batch = process_logs(
        &client,
        family(EventFamily::Bridge),
        &[log],
        &definitions,
        &PipelineConfig::default(),
        None,
    )
    .await;

    assert_eq!(batch.event_logs.len(), 1);
    assert_eq!(batch.event_logs[0].event_name, "SentTokens");
    let fields = formatted(&batch.event_logs[0].data);
    assert_eq!(lower(&fields["to_user"]), format!("{:#x}", BOB));
    assert_eq!(lower(&fields["from_user"]), format!("{:#x}", ALICE));
    assert_eq!(fields["from_chain"], json!("ethereum"));
    assert_eq!(fields["to_chain"], json!("arbitrum"));
    assert_eq!(fields["amount"], json!("5000"));
    assert_eq!(fields["exchange_rate"], json!("2"));
}

#[tokio::test]
async fn test_bad_payload_only_drops_its_own_log() {
    let client = FakeChainClient::default();
    let definitions = definitions(TOKEN, EventFamily::Erc20, &["Transfer"]);
    let mut logs: Vec<RawLog> = (1..=10).map(|n| transfer_log(n, n * 10)).collect();
    logs[4].data = Bytes::from(vec![0xff; 7]);

    let config = PipelineConfig {
        concurrency: 4,
        ..PipelineConfig::default()
    };
    let batch = process_logs(
        &client,
        family(EventFamily::Erc20),
        &logs,
        &definitions,
        &config,
        None,
    )
    .await;

    let indexes: Vec<u64> = batch.event_logs.iter().map(|r| r.log_index).collect();
    assert_eq!(indexes, vec![1, 2, 3, 4, 6, 7, 8, 9, 10]);
    assert_eq!(batch.action_count(), 9);
    assert_eq!(batch.diagnostics.len(), 1);
    assert_eq!(batch.diagnostics[0].log_index, 5);
    assert!(matches!(batch.diagnostics[0].error, LogError::Decode(_)));
}

#[tokio::test]
async fn test_records_trace_back_to_source_logs_in_order() {
    let client = FakeChainClient::default();
    let definitions = definitions(TOKEN, EventFamily::Erc20, &["Transfer"]);
    let logs: Vec<RawLog> = (1..=25).map(|n| transfer_log(n, n)).collect();

    let config = PipelineConfig {
        concurrency: 8,
        ..PipelineConfig::default()
    };
    let batch = process_logs(
        &client,
        family(EventFamily::Erc20),
        &logs,
        &definitions,
        &config,
        None,
    )
    .await;

    assert_eq!(batch.event_logs.len(), logs.len());
    for (record, log) in batch.event_logs.iter().zip(&logs) {
        assert_eq!(record.transaction_hash, log.transaction_hash);
        assert_eq!(record.log_index, log.log_index);
    }
}

#[tokio::test]
async fn test_two_logs_from_one_sender_share_a_key() {
    let client = FakeChainClient::default()
        .with(tx_hash(1), Lookup::Mined(ALICE))
        .with(tx_hash(2), Lookup::Mined(ALICE))
        .with(tx_hash(3), Lookup::Mined(BOB));
    let definitions = definitions(TOKEN, EventFamily::Erc20, &["Transfer"]);
    let logs = vec![transfer_log(1, 1), transfer_log(2, 2), transfer_log(3, 3)];

    let batch = process_logs(
        &client,
        family(EventFamily::Erc20),
        &logs,
        &definitions,
        &PipelineConfig::default(),
        None,
    )
    .await;

    let alice = &batch.user_actions[&ALICE.to_checksum(None)];
    assert_eq!(alice.len(), 2);
    assert_ne!(alice[0].id, alice[1].id);
    assert_eq!(batch.user_actions[&BOB.to_checksum(None)].len(), 1);
}

#[tokio::test]
async fn test_unmatched_log_produces_nothing() {
    let client = FakeChainClient::default();
    let definitions = definitions(TOKEN, EventFamily::Erc20, &["Transfer"]);
    let mut unrelated = transfer_log(2, 1);
    unrelated.topics[0] = keccak256("Paused(address)");
    let logs = vec![transfer_log(1, 1), unrelated, transfer_log(3, 1)];

    let batch = process_logs(
        &client,
        family(EventFamily::Erc20),
        &logs,
        &definitions,
        &PipelineConfig::default(),
        None,
    )
    .await;

    let indexes: Vec<u64> = batch.event_logs.iter().map(|r| r.log_index).collect();
    assert_eq!(indexes, vec![1, 3]);
    assert_eq!(batch.action_count(), 2);
    assert_eq!(batch.diagnostics.len(), 1);
    assert!(batch.diagnostics[0].error.is_skip());
}

#[tokio::test]
async fn test_pending_transaction_is_filed_under_unresolved_sender() {
    let client = FakeChainClient::default().with(tx_hash(1), Lookup::Pending);
    let definitions = definitions(TOKEN, EventFamily::Erc20, &["Transfer"]);

    let batch = process_logs(
        &client,
        family(EventFamily::Erc20),
        &[transfer_log(1, 1)],
        &definitions,
        &PipelineConfig::default(),
        None,
    )
    .await;

    assert_eq!(batch.event_logs.len(), 1);
    assert_eq!(batch.user_actions[UNRESOLVED_SENDER].len(), 1);
    assert!(batch.diagnostics.is_empty());
}

#[tokio::test]
async fn test_sender_failure_follows_policy() {
    let client = FakeChainClient::default()
        .with(tx_hash(1), Lookup::SenderFails)
        .with(tx_hash(2), Lookup::LookupFails);
    let definitions = definitions(TOKEN, EventFamily::Erc20, &["Transfer"]);
    let logs = vec![transfer_log(1, 1), transfer_log(2, 1), transfer_log(3, 1)];

    let dropped = process_logs(
        &client,
        family(EventFamily::Erc20),
        &logs,
        &definitions,
        &PipelineConfig::default(),
        None,
    )
    .await;
    assert_eq!(dropped.event_logs.len(), 1);
    assert_eq!(dropped.event_logs[0].log_index, 3);
    assert!(!dropped.user_actions.contains_key(UNRESOLVED_SENDER));
    assert_eq!(dropped.diagnostics.len(), 2);

    let kept = process_logs(
        &client,
        family(EventFamily::Erc20),
        &logs,
        &definitions,
        &PipelineConfig {
            sender_policy: SenderPolicy::Unresolved,
            ..PipelineConfig::default()
        },
        None,
    )
    .await;
    assert_eq!(kept.event_logs.len(), 3);
    assert_eq!(kept.user_actions[UNRESOLVED_SENDER].len(), 2);
    assert_eq!(kept.user_actions[&SENDER.to_checksum(None)].len(), 1);
    assert!(matches!(
        kept.diagnostics[0].error,
        LogError::SenderResolution(_)
    ));
    assert!(matches!(
        kept.diagnostics[1].error,
        LogError::TransactionLookup(_)
    ));
}
