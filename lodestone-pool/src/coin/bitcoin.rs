//! Bitcoin job construction and share validation.
//!
//! A [`BitcoinJob`] freezes one block template into the form stratum
//! miners consume: a coinbase split around the extranonce placeholder,
//! cached merkle branch steps, and the stratum `mining.notify` parameter
//! array. Submitted shares are reassembled into an 80-byte header, hashed,
//! and judged against the worker difficulty and the network target.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use ruint::aliases::U256;
use serde_json::{Value, json};
use time::OffsetDateTime;

use super::{EXTRANONCE_PLACEHOLDER_LENGTH, merkle, sha256d, target};
use crate::config::PoolConfig;
use crate::daemon::{BlockchainInfo, BlockTemplate, DaemonClient};
use crate::error::{Error, Result};
use crate::job::{JobSource, JobUpdate, PoolJob, SyncState};
use crate::stratum::rpc::{StratumError, StratumException};
use crate::tracing::prelude::*;

/// How far into the future a submitted ntime may lie, in seconds.
const MAX_NTIME_DRIFT: i64 = 7200;

/// Coinbase script tag, pushed after the extranonce.
const SIGNATURE_TAG: &[u8] = b"/lodestone/";

/// Outcome of a validated share.
#[derive(Debug, Clone)]
pub struct ProcessedShare {
    pub height: u64,
    /// Difficulty credited to the worker.
    pub difficulty: f64,
    /// Difficulty the hash actually achieved.
    pub share_difficulty: f64,
    pub network_difficulty: f64,
    pub is_block_candidate: bool,
    /// Display-order block hash, set for candidates.
    pub block_hash: Option<String>,
    /// Full serialized block, set for candidates.
    pub block_hex: Option<String>,
}

pub struct BitcoinJob {
    id: String,
    height: u64,
    version: u32,
    prev_hash_internal: [u8; 32],
    prev_hash_stratum: String,
    bits: u32,
    bits_hex: String,
    cur_time: u32,
    block_target: U256,
    network_difficulty: f64,
    reward: u64,
    coinbase_initial: Vec<u8>,
    coinbase_final: Vec<u8>,
    merkle_steps: Vec<[u8; 32]>,
    raw_transactions: Vec<u8>,
    transaction_count: usize,
    submissions: Mutex<HashSet<String>>,
}

impl BitcoinJob {
    /// Freeze `template` into a job paying `pool_script`.
    pub fn new(id: String, template: &BlockTemplate, pool_script: &[u8]) -> Result<Self> {
        let prev_be: [u8; 32] = decode_hash(&template.previous_block_hash)?;
        let mut prev_hash_internal = prev_be;
        prev_hash_internal.reverse();

        // Stratum wants the previous hash with its eight 4-byte words in
        // reverse order, bytes within each word untouched.
        let mut prev_hash_stratum = String::with_capacity(64);
        for word in prev_be.chunks(4).rev() {
            prev_hash_stratum.push_str(&hex::encode(word));
        }

        let bits = u32::from_str_radix(&template.bits, 16)
            .map_err(|_| Error::Protocol(format!("bad bits in template: {}", template.bits)))?;
        let block_target = target::target_from_hex(&template.target)
            .ok_or_else(|| Error::Protocol(format!("bad target in template: {}", template.target)))?;
        let network_difficulty = target::target_to_difficulty(block_target);

        let mut tx_hashes = Vec::with_capacity(template.transactions.len());
        let mut raw_transactions = Vec::new();
        for tx in &template.transactions {
            let id_hex = tx.txid.as_deref().or(tx.hash.as_deref()).ok_or_else(|| {
                Error::Protocol("template transaction without txid or hash".into())
            })?;
            let mut hash: [u8; 32] = decode_hash(id_hex)?;
            hash.reverse();
            tx_hashes.push(hash);
            raw_transactions.extend_from_slice(&hex::decode(&tx.data).map_err(|e| {
                Error::Protocol(format!("bad transaction data in template: {e}"))
            })?);
        }
        let merkle_steps = merkle::branch_steps(&tx_hashes);

        let (coinbase_initial, coinbase_final) = build_coinbase(template, pool_script)?;

        Ok(Self {
            id,
            height: template.height,
            version: template.version,
            prev_hash_internal,
            prev_hash_stratum,
            bits,
            bits_hex: template.bits.clone(),
            cur_time: template.cur_time,
            block_target,
            network_difficulty,
            reward: template.coinbase_value,
            coinbase_initial,
            coinbase_final,
            merkle_steps,
            raw_transactions,
            transaction_count: template.transactions.len(),
            submissions: Mutex::new(HashSet::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn network_difficulty(&self) -> f64 {
        self.network_difficulty
    }

    pub fn reward(&self) -> u64 {
        self.reward
    }

    /// The `mining.notify` parameter array.
    pub fn notify_params(&self, clean: bool) -> Value {
        let branches: Vec<String> = self.merkle_steps.iter().map(hex::encode).collect();
        json!([
            self.id,
            self.prev_hash_stratum,
            hex::encode(&self.coinbase_initial),
            hex::encode(&self.coinbase_final),
            branches,
            format!("{:08x}", self.version),
            self.bits_hex,
            format!("{:08x}", self.cur_time),
            clean,
        ])
    }

    /// Validate one submission against this job.
    ///
    /// `previous_difficulty` is consulted for shares straddling a vardiff
    /// retarget: a share too weak for the current difficulty still counts
    /// if it met the difficulty in force when the miner started on it.
    pub fn process_share(
        &self,
        extranonce1: &str,
        difficulty: f64,
        previous_difficulty: Option<f64>,
        extranonce2: &str,
        ntime: &str,
        nonce: &str,
    ) -> std::result::Result<ProcessedShare, StratumException> {
        if ntime.len() != 8 {
            return Err(StratumException::new(
                StratumError::Other,
                "incorrect size of ntime",
            ));
        }
        let ntime_int = u32::from_str_radix(ntime, 16)
            .map_err(|_| StratumException::new(StratumError::Other, "malformed ntime"))?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (ntime_int as i64) < (self.cur_time as i64) || (ntime_int as i64) > now + MAX_NTIME_DRIFT
        {
            return Err(StratumException::new(
                StratumError::Other,
                "ntime out of range",
            ));
        }

        if nonce.len() != 8 {
            return Err(StratumException::new(
                StratumError::Other,
                "incorrect size of nonce",
            ));
        }
        let nonce_int = u32::from_str_radix(nonce, 16)
            .map_err(|_| StratumException::new(StratumError::Other, "malformed nonce"))?;

        let extranonce1_bytes = hex::decode(extranonce1)
            .map_err(|_| StratumException::new(StratumError::Other, "malformed extranonce1"))?;
        let extranonce2_bytes = hex::decode(extranonce2)
            .map_err(|_| StratumException::new(StratumError::Other, "malformed extranonce2"))?;

        if !self.register_submit(extranonce1, extranonce2, ntime, nonce) {
            return Err(StratumException::new(
                StratumError::DuplicateShare,
                "duplicate share",
            ));
        }

        // Reassemble the coinbase and fold it into the merkle root.
        let mut coinbase = Vec::with_capacity(
            self.coinbase_initial.len()
                + extranonce1_bytes.len()
                + extranonce2_bytes.len()
                + self.coinbase_final.len(),
        );
        coinbase.extend_from_slice(&self.coinbase_initial);
        coinbase.extend_from_slice(&extranonce1_bytes);
        coinbase.extend_from_slice(&extranonce2_bytes);
        coinbase.extend_from_slice(&self.coinbase_final);
        let coinbase_hash = sha256d(&coinbase);
        let merkle_root = merkle::root_with_first(coinbase_hash, &self.merkle_steps);

        let header = self.serialize_header(&merkle_root, ntime_int, nonce_int);
        let header_hash = sha256d(&header);

        let share_difficulty = target::hash_difficulty(&header_hash);
        let is_block_candidate = target::hash_value(&header_hash) <= self.block_target;

        // Shares are graded with 1% slack for float rounding.
        let mut credited_difficulty = difficulty;
        if !is_block_candidate && share_difficulty / difficulty < 0.99 {
            match previous_difficulty {
                Some(previous) if share_difficulty / previous >= 0.99 => {
                    credited_difficulty = previous;
                }
                _ => {
                    return Err(StratumException::new(
                        StratumError::LowDifficultyShare,
                        format!("low difficulty share ({share_difficulty})"),
                    ));
                }
            }
        }

        let (block_hash, block_hex) = if is_block_candidate {
            let mut display_hash = header_hash;
            display_hash.reverse();
            (
                Some(hex::encode(display_hash)),
                Some(hex::encode(self.serialize_block(&header, &coinbase))),
            )
        } else {
            (None, None)
        };

        Ok(ProcessedShare {
            height: self.height,
            difficulty: credited_difficulty,
            share_difficulty,
            network_difficulty: self.network_difficulty,
            is_block_candidate,
            block_hash,
            block_hex,
        })
    }

    /// Record a submission key, rejecting repeats. Hex case differences do
    /// not make a submission fresh.
    fn register_submit(
        &self,
        extranonce1: &str,
        extranonce2: &str,
        ntime: &str,
        nonce: &str,
    ) -> bool {
        let key = format!(
            "{extranonce1}{}{ntime}{}",
            extranonce2.to_lowercase(),
            nonce.to_lowercase()
        );
        self.submissions.lock().insert(key)
    }

    fn serialize_header(&self, merkle_root: &[u8; 32], ntime: u32, nonce: u32) -> [u8; 80] {
        let mut header = [0u8; 80];
        header[0..4].copy_from_slice(&self.version.to_le_bytes());
        header[4..36].copy_from_slice(&self.prev_hash_internal);
        header[36..68].copy_from_slice(merkle_root);
        header[68..72].copy_from_slice(&ntime.to_le_bytes());
        header[72..76].copy_from_slice(&self.bits.to_le_bytes());
        header[76..80].copy_from_slice(&nonce.to_le_bytes());
        header
    }

    fn serialize_block(&self, header: &[u8; 80], coinbase: &[u8]) -> Vec<u8> {
        let mut block = Vec::with_capacity(
            80 + 9 + coinbase.len() + self.raw_transactions.len(),
        );
        block.extend_from_slice(header);
        write_varint(&mut block, (self.transaction_count + 1) as u64);
        block.extend_from_slice(coinbase);
        block.extend_from_slice(&self.raw_transactions);
        block
    }
}

impl PoolJob for BitcoinJob {
    fn id(&self) -> &str {
        BitcoinJob::id(self)
    }

    fn height(&self) -> u64 {
        BitcoinJob::height(self)
    }

    fn reward(&self) -> u64 {
        BitcoinJob::reward(self)
    }

    fn network_difficulty(&self) -> f64 {
        BitcoinJob::network_difficulty(self)
    }

    fn notify_params(&self, clean: bool) -> Value {
        BitcoinJob::notify_params(self, clean)
    }

    fn process_share(
        &self,
        extranonce1: &str,
        difficulty: f64,
        previous_difficulty: Option<f64>,
        extranonce2: &str,
        ntime: &str,
        nonce: &str,
    ) -> std::result::Result<ProcessedShare, StratumException> {
        BitcoinJob::process_share(
            self,
            extranonce1,
            difficulty,
            previous_difficulty,
            extranonce2,
            ntime,
            nonce,
        )
    }
}

/// Bitcoin-family upstream: bitcoind RPC probes and template polling.
pub struct BitcoinJobSource {
    client: DaemonClient,
    config: Arc<PoolConfig>,
    /// Payout scriptPubKey, resolved during initialization.
    pool_script: Mutex<Vec<u8>>,
    last_prev_hash: Mutex<Option<String>>,
}

impl BitcoinJobSource {
    pub fn new(config: Arc<PoolConfig>) -> Self {
        Self {
            client: DaemonClient::new(config.daemon.clone()),
            config,
            pool_script: Mutex::new(Vec::new()),
            last_prev_hash: Mutex::new(None),
        }
    }
}

#[async_trait]
impl JobSource for BitcoinJobSource {
    async fn probe_health(&self) -> Result<String> {
        let info = self.client.get_network_info().await?;
        Ok(format!(
            "{} at {} ({} peers)",
            info.sub_version,
            self.client.url(),
            info.connections
        ))
    }

    async fn probe_sync(&self) -> Result<SyncState> {
        let info = self.client.get_blockchain_info().await?;
        Ok(SyncState {
            synced: is_synced(&info),
            detail: format!(
                "{} {}/{} blocks ({:.2}%)",
                info.chain,
                info.blocks,
                info.headers,
                info.verification_progress * 100.0
            ),
        })
    }

    /// Resolve the payout address. A bad address is fatal; polling with
    /// it would produce unspendable blocks.
    async fn initialize(&self) -> Result<()> {
        let info = self.client.validate_address(&self.config.address).await?;
        if !info.is_valid {
            return Err(Error::StartupAborted(format!(
                "daemon rejected pool address {}",
                self.config.address
            )));
        }
        let script_hex = info.script_pub_key.ok_or_else(|| {
            Error::StartupAborted(format!(
                "no scriptPubKey for pool address {}",
                self.config.address
            ))
        })?;
        let script = hex::decode(&script_hex)
            .map_err(|e| Error::StartupAborted(format!("bad scriptPubKey: {e}")))?;
        *self.pool_script.lock() = script;
        info!(address = %self.config.address, "pool address verified");
        Ok(())
    }

    async fn refresh(&self, job_id: String, rebroadcast: bool) -> Result<Option<JobUpdate>> {
        let template = self.client.get_block_template().await?;

        // A reorg at the same height still changes the previous hash.
        let chain_moved = {
            let mut last = self.last_prev_hash.lock();
            if last.as_deref() != Some(template.previous_block_hash.as_str()) {
                *last = Some(template.previous_block_hash.clone());
                true
            } else {
                false
            }
        };
        if !chain_moved && !rebroadcast {
            return Ok(None);
        }

        let script = self.pool_script.lock().clone();
        let job = BitcoinJob::new(job_id, &template, &script)?;
        Ok(Some(JobUpdate {
            job: Arc::new(job),
            clean: chain_moved,
        }))
    }

    async fn submit_block(&self, block_hex: &str) -> Result<Option<String>> {
        self.client.submit_block(block_hex).await
    }
}

/// Whether the daemon is usable as a work source.
fn is_synced(info: &BlockchainInfo) -> bool {
    if info.initial_block_download {
        return false;
    }
    info.headers == 0 || info.blocks >= info.headers
}

fn decode_hash(hex_str: &str) -> Result<[u8; 32]> {
    hex::decode(hex_str)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| Error::Protocol(format!("bad 32-byte hash: {hex_str}")))
}

fn write_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Minimal script integer push (CScriptNum encoding).
fn push_script_int(out: &mut Vec<u8>, value: i64) {
    if value == 0 {
        out.push(0x00); // OP_0
        return;
    }
    let mut bytes = Vec::new();
    let mut abs = value.unsigned_abs();
    while abs > 0 {
        bytes.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    // Keep the sign bit clear for positive numbers.
    if bytes.last().is_some_and(|b| b & 0x80 != 0) {
        bytes.push(0);
    }
    if value < 0 {
        let last = bytes.len() - 1;
        bytes[last] |= 0x80;
    }
    out.push(bytes.len() as u8);
    out.extend_from_slice(&bytes);
}

fn push_script_bytes(out: &mut Vec<u8>, data: &[u8]) {
    // Direct pushes only; all our data is well under 76 bytes.
    debug_assert!(data.len() < 76);
    out.push(data.len() as u8);
    out.extend_from_slice(data);
}

/// Build the two coinbase halves surrounding the extranonce placeholder.
fn build_coinbase(template: &BlockTemplate, pool_script: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    // Script prefix: BIP34 height, then the current time so two templates
    // at the same height still differ.
    let mut script_prefix = Vec::new();
    push_script_int(&mut script_prefix, template.height as i64);
    push_script_int(
        &mut script_prefix,
        OffsetDateTime::now_utc().unix_timestamp(),
    );

    let mut script_suffix = Vec::new();
    push_script_bytes(&mut script_suffix, SIGNATURE_TAG);

    let script_length =
        script_prefix.len() + EXTRANONCE_PLACEHOLDER_LENGTH + script_suffix.len();

    // initial: tx version, one input spending the null outpoint, script
    // length, script up to the extranonce.
    let mut initial = Vec::new();
    initial.extend_from_slice(&1u32.to_le_bytes());
    write_varint(&mut initial, 1);
    initial.extend_from_slice(&[0u8; 32]);
    initial.extend_from_slice(&u32::MAX.to_le_bytes());
    write_varint(&mut initial, script_length as u64);
    initial.extend_from_slice(&script_prefix);

    // final: rest of the script, sequence, outputs, locktime.
    let mut fin = Vec::new();
    fin.extend_from_slice(&script_suffix);
    fin.extend_from_slice(&0u32.to_le_bytes());

    let witness_commitment = template
        .default_witness_commitment
        .as_deref()
        .map(hex::decode)
        .transpose()
        .map_err(|e| Error::Protocol(format!("bad witness commitment: {e}")))?;

    let output_count = 1 + witness_commitment.is_some() as u64;
    write_varint(&mut fin, output_count);

    if let Some(commitment) = &witness_commitment {
        fin.extend_from_slice(&0u64.to_le_bytes());
        write_varint(&mut fin, commitment.len() as u64);
        fin.extend_from_slice(commitment);
    }

    fin.extend_from_slice(&template.coinbase_value.to_le_bytes());
    write_varint(&mut fin, pool_script.len() as u64);
    fin.extend_from_slice(pool_script);

    fin.extend_from_slice(&0u32.to_le_bytes());

    Ok((initial, fin))
}
