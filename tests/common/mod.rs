//! Test doubles: a simulated Ledger running the Ethereum app and a
//! scriptable upstream node.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{keccak256, Address, Bytes, B256};
use alloy_rlp::{Decodable, Header};
use async_trait::async_trait;
use serde_json::{json, Value};

use ledger_eth_provider::apdu::{ApduAnswer, ApduCommand};
use ledger_eth_provider::config::default_derivation;
use ledger_eth_provider::error::TransportError;
use ledger_eth_provider::types::DiscoveredDevice;
use ledger_eth_provider::{
    AccountSelector, Bip32Path, DeviceFilter, DeviceModel, DeviceSession, LedgerProvider,
    RpcError, RpcTransport, Signer, Transport,
};

pub const SW_OK: u16 = 0x9000;
pub const SW_DENIED: u16 = 0x6985;
pub const SW_LOCKED: u16 = 0x5515;
pub const SW_APP_NOT_FOUND: u16 = 0x6807;
pub const SW_CLA_NOT_SUPPORTED: u16 = 0x6E00;

pub const ETHEREUM: &str = "Ethereum";
pub const DASHBOARD: &str = "BOLOS";

/// Address the simulator reports for `m/44'/60'/0'/0/0`.
pub const ACCOUNT_0: &str = "0xCD2a3d9F938E13CD947Ec05AbC7FE734Df8DD826";

#[derive(Default)]
struct SimState {
    devices: Vec<DiscoveredDevice>,
    app: Mutex<String>,
    addresses: Mutex<HashMap<Vec<u8>, Address>>,
    pending: Mutex<Vec<u8>>,
    sent: Mutex<Vec<ApduCommand>>,
    signed: Mutex<Vec<(u8, Vec<u8>)>>,
    locked: AtomicBool,
    reject: AtomicBool,
    odd_parity: AtomicBool,
    io_failure: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    reconnects: AtomicUsize,
}

/// In-memory Ledger speaking the Ethereum app APDU protocol.
///
/// Clones share state, so a test keeps one handle for switches and
/// inspection after boxing another into a session.
#[derive(Clone)]
pub struct SimulatedLedger {
    state: Arc<SimState>,
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::with_devices(vec![DiscoveredDevice {
            device_id: "sim-1".into(),
            model: DeviceModel::NanoX,
        }])
    }
}

impl SimulatedLedger {
    pub fn with_devices(devices: Vec<DiscoveredDevice>) -> Self {
        let ledger = Self {
            state: Arc::new(SimState {
                devices,
                app: Mutex::new(ETHEREUM.into()),
                ..Default::default()
            }),
        };
        let account_0: Address = ACCOUNT_0.parse().unwrap();
        ledger.set_address(0, account_0);
        ledger
    }

    pub fn set_address(&self, index: u32, address: Address) {
        let key = Bip32Path::ethereum(index).serialize();
        self.state.addresses.lock().unwrap().insert(key, address);
    }

    /// Address for `index`: the configured one, else derived from the path.
    pub fn address(&self, index: u32) -> Address {
        self.address_for(&Bip32Path::ethereum(index).serialize())
    }

    pub fn set_app(&self, name: &str) {
        *self.state.app.lock().unwrap() = name.into();
    }

    pub fn app(&self) -> String {
        self.state.app.lock().unwrap().clone()
    }

    pub fn set_locked(&self, locked: bool) {
        self.state.locked.store(locked, Ordering::SeqCst);
    }

    pub fn set_reject(&self, reject: bool) {
        self.state.reject.store(reject, Ordering::SeqCst);
    }

    pub fn set_odd_parity(&self, odd: bool) {
        self.state.odd_parity.store(odd, Ordering::SeqCst);
    }

    /// Fail every exchange with an OS permission error.
    pub fn set_io_failure(&self, fail: bool) {
        self.state.io_failure.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ApduCommand> {
        self.state.sent.lock().unwrap().clone()
    }

    /// Completed signing payloads as `(ins, payload)`, path stripped.
    pub fn signed(&self) -> Vec<(u8, Vec<u8>)> {
        self.state.signed.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    pub fn boxed(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }

    fn address_for(&self, path: &[u8]) -> Address {
        if let Some(address) = self.state.addresses.lock().unwrap().get(path) {
            return *address;
        }
        Address::from_slice(&keccak256(path)[12..])
    }

    fn handle(&self, cmd: &ApduCommand) -> Result<Vec<u8>, u16> {
        if self.state.locked.load(Ordering::SeqCst) {
            return Err(SW_LOCKED);
        }
        match (cmd.cla, cmd.ins) {
            (0xB0, 0x01) => Ok(self.app_info()),
            (0xB0, 0xA7) => {
                self.set_app(DASHBOARD);
                Ok(Vec::new())
            }
            (0xE0, 0xD8) => {
                if cmd.data != ETHEREUM.as_bytes() {
                    return Err(SW_APP_NOT_FOUND);
                }
                self.set_app(ETHEREUM);
                Ok(Vec::new())
            }
            (0xE0, _) if self.app() != ETHEREUM => Err(SW_CLA_NOT_SUPPORTED),
            (0xE0, 0x02) => self.get_address(&cmd.data),
            (0xE0, 0x04) => self.sign_chunk(cmd, tx_complete),
            (0xE0, 0x06) => Ok(vec![0x01, 1, 10, 4]),
            (0xE0, 0x08) => self.sign_chunk(cmd, message_complete),
            (0xE0, 0x0C) => self.finish_signing(0x0C, cmd.data.clone()),
            _ => Err(0x6D00),
        }
    }

    fn app_info(&self) -> Vec<u8> {
        let name = self.app();
        let version = if name == ETHEREUM { "1.10.4" } else { "2.1.0" };
        let mut out = vec![0x01, name.len() as u8];
        out.extend_from_slice(name.as_bytes());
        out.push(version.len() as u8);
        out.extend_from_slice(version.as_bytes());
        out.extend_from_slice(&[0x01, 0x02]);
        out
    }

    fn get_address(&self, path: &[u8]) -> Result<Vec<u8>, u16> {
        if self.state.reject.load(Ordering::SeqCst) {
            return Err(SW_DENIED);
        }
        let address = self.address_for(path);
        let seed = keccak256(path);
        let mut out = vec![65, 0x04];
        out.extend_from_slice(seed.as_slice());
        out.extend_from_slice(keccak256(seed).as_slice());
        out.push(40);
        out.extend_from_slice(hex::encode(address).as_bytes());
        Ok(out)
    }

    fn sign_chunk(
        &self,
        cmd: &ApduCommand,
        complete: fn(&[u8]) -> bool,
    ) -> Result<Vec<u8>, u16> {
        let payload = {
            let mut pending = self.state.pending.lock().unwrap();
            if cmd.p1 == 0x00 {
                pending.clear();
            }
            pending.extend_from_slice(&cmd.data);
            if !complete(strip_path(&pending)) {
                return Ok(Vec::new());
            }
            std::mem::take(&mut *pending)
        };
        self.finish_signing(cmd.ins, payload)
    }

    fn finish_signing(&self, ins: u8, payload: Vec<u8>) -> Result<Vec<u8>, u16> {
        if self.state.reject.load(Ordering::SeqCst) {
            return Err(SW_DENIED);
        }
        let body = strip_path(&payload).to_vec();
        let parity = u8::from(self.state.odd_parity.load(Ordering::SeqCst));
        let v = match ins {
            0x04 => match legacy_chain_id(&body) {
                Some(chain_id) => {
                    (chain_id.wrapping_mul(2).wrapping_add(35) as u8).wrapping_add(parity)
                }
                None => parity,
            },
            _ => 27 + parity,
        };

        let r: B256 = keccak256(&body);
        let s: B256 = keccak256(r);
        self.state.signed.lock().unwrap().push((ins, body));

        let mut out = vec![v];
        out.extend_from_slice(r.as_slice());
        out.extend_from_slice(s.as_slice());
        Ok(out)
    }
}

fn strip_path(payload: &[u8]) -> &[u8] {
    let n = payload.first().copied().unwrap_or(0) as usize;
    payload.get(1 + 4 * n..).unwrap_or(&[])
}

fn tx_complete(body: &[u8]) -> bool {
    let rlp = match body.first() {
        Some(b) if *b < 0xC0 => &body[1..],
        Some(_) => body,
        None => return false,
    };
    let mut buf = rlp;
    match Header::decode(&mut buf) {
        Ok(header) => buf.len() >= header.payload_length,
        Err(_) => false,
    }
}

fn message_complete(body: &[u8]) -> bool {
    if body.len() < 4 {
        return false;
    }
    let len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
    body.len() - 4 >= len
}

/// Chain id of a legacy EIP-155 payload; `None` for typed payloads.
fn legacy_chain_id(rlp: &[u8]) -> Option<u64> {
    if rlp.first().map_or(true, |b| *b < 0xC0) {
        return None;
    }
    let mut buf = rlp;
    Header::decode(&mut buf).ok()?;
    // nonce, gasPrice, gas, to, value, data
    for _ in 0..6 {
        Bytes::decode(&mut buf).ok()?;
    }
    u64::decode(&mut buf).ok()
}

#[async_trait]
impl Transport for SimulatedLedger {
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>, TransportError> {
        Ok(self.state.devices.clone())
    }

    async fn connect(&self, _device: &DiscoveredDevice) -> Result<(), TransportError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_frame(&self, command: &ApduCommand) -> Result<ApduAnswer, TransportError> {
        if self.state.io_failure.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::ErrorKind::PermissionDenied.into()));
        }
        self.state.sent.lock().unwrap().push(command.clone());
        let raw = match self.handle(command) {
            Ok(mut data) => {
                data.extend_from_slice(&SW_OK.to_be_bytes());
                data
            }
            Err(sw) => sw.to_be_bytes().to_vec(),
        };
        Ok(ApduAnswer::from_raw(raw))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.state.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Upstream node with canned answers and a call log.
pub struct MockRpc {
    responses: Mutex<HashMap<String, Result<Value, RpcError>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl Default for MockRpc {
    fn default() -> Self {
        let rpc = Self {
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        };
        rpc.respond("eth_chainId", json!("0x1"));
        rpc.respond("eth_getTransactionCount", json!("0x9"));
        rpc.respond("eth_estimateGas", json!("0x5208"));
        rpc.respond("eth_gasPrice", json!("0x4a817c800"));
        rpc.respond("eth_getBlockByNumber", json!({ "number": "0x10", "baseFeePerGas": "0x3b9aca00" }));
        rpc.respond("eth_maxPriorityFeePerGas", json!("0x77359400"));
        rpc.respond("eth_blockNumber", json!("0x10"));
        rpc
    }
}

impl MockRpc {
    pub fn respond(&self, method: &str, result: Value) {
        self.responses
            .lock()
            .unwrap()
            .insert(method.into(), Ok(result));
    }

    pub fn fail(&self, method: &str, error: RpcError) {
        self.responses
            .lock()
            .unwrap()
            .insert(method.into(), Err(error));
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params)
            .collect()
    }
}

#[async_trait]
impl RpcTransport for MockRpc {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));

        if method == "eth_sendRawTransaction" {
            let raw = params[0].as_str().unwrap_or_default();
            let bytes = hex::decode(raw.trim_start_matches("0x"))
                .map_err(|e| RpcError::new(-32602, e.to_string()))?;
            return Ok(json!(keccak256(bytes)));
        }

        self.responses
            .lock()
            .unwrap()
            .get(method)
            .cloned()
            .unwrap_or_else(|| Err(RpcError::new(-32601, format!("method {method} not found"))))
    }
}

pub fn signer(ledger: &SimulatedLedger) -> Signer {
    Signer::new(DeviceSession::new(ledger.boxed()).with_action_timeout(Duration::from_secs(5)))
}

/// Provider over `ledger` and `rpc`, not yet initialized.
pub fn provider(
    ledger: &SimulatedLedger,
    rpc: Arc<MockRpc>,
    accounts: Vec<AccountSelector>,
) -> LedgerProvider {
    LedgerProvider::new(rpc, signer(ledger), accounts, default_derivation())
}

pub async fn ready_provider(
    ledger: &SimulatedLedger,
    rpc: Arc<MockRpc>,
    accounts: Vec<AccountSelector>,
) -> LedgerProvider {
    let mut provider = provider(ledger, rpc, accounts);
    provider
        .initialize(&DeviceFilter::default(), Duration::from_secs(5))
        .await
        .expect("initialize");
    provider
}
