//! Simulated XCP bootloader for tests and demos.
//!
//! Plug it into a [`MockTransport`] with [`SimTarget::attach`]. Memory is
//! sparse; unwritten bytes read back as `0xFF` like erased flash.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};

use super::constants::*;
use super::packet::Endianness;
use crate::transport::MockTransport;

/// Static properties of the simulated target.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub max_cto: u8,
    /// MAX_CTO_PGM reported by PROGRAM_START; 0 reuses `max_cto`.
    pub max_cto_pgm: u8,
    pub byte_order: Endianness,
    /// Whether CONNECT advertises the PGM resource.
    pub programming: bool,
    /// Writable and erasable addresses.
    pub flash: Range<u64>,
    /// PROGRAM_CLEAR rounds out to multiples of this many bytes.
    pub erase_block: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_cto: 8,
            max_cto_pgm: 0,
            byte_order: Endianness::Intel,
            programming: true,
            flash: 0..1u64 << 32,
            erase_block: 1,
        }
    }
}

#[derive(Default)]
struct SimState {
    memory: BTreeMap<u32, u8>,
    connected: bool,
    programming: bool,
    mta: u32,
    silent: bool,
    lost_responses: u32,
    busy_responses: u32,
    rejections: Vec<(u8, u8)>,
    commands: Vec<u8>,
    resets: u32,
}

/// Simulated target. Clones share state.
#[derive(Clone)]
pub struct SimTarget {
    config: Arc<SimConfig>,
    state: Arc<Mutex<SimState>>,
}

impl SimTarget {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Answer every request `mock` receives once its reply queue is empty.
    pub fn attach(&self, mock: &MockTransport) {
        let target = self.clone();
        mock.set_responder(move |request| target.handle(request));
    }

    /// Stop answering anything.
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Execute the next `n` commands but lose their responses.
    pub fn lose_responses(&self, n: u32) {
        self.lock().lost_responses = n;
    }

    /// Answer the next `n` commands with `ERR_CMD_BUSY` without executing them.
    pub fn busy_responses(&self, n: u32) {
        self.lock().busy_responses = n;
    }

    /// Always reject `command` with `error`.
    pub fn reject(&self, command: u8, error: u8) {
        self.lock().rejections.push((command, error));
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Number of PROGRAM_RESET commands executed.
    pub fn resets(&self) -> u32 {
        self.lock().resets
    }

    /// Command codes executed so far, including those whose response was lost.
    pub fn commands(&self) -> Vec<u8> {
        self.lock().commands.clone()
    }

    /// Read `len` bytes of simulated memory.
    pub fn read(&self, address: u32, len: usize) -> Vec<u8> {
        let state = self.lock();
        read_memory(&state.memory, address, len)
    }

    /// Preload memory without going through the protocol.
    pub fn write(&self, address: u32, data: &[u8]) {
        let mut state = self.lock();
        for (i, b) in data.iter().enumerate() {
            state.memory.insert(address.wrapping_add(i as u32), *b);
        }
    }

    /// Process one request packet. `None` means no response.
    pub fn handle(&self, request: &[u8]) -> Option<Vec<u8>> {
        let mut state = self.lock();
        if state.silent || request.is_empty() {
            return None;
        }
        let command = request[0];
        if state.busy_responses > 0 {
            state.busy_responses -= 1;
            return Some(vec![PID_ERR, ERR_CMD_BUSY]);
        }
        let rejection = state
            .rejections
            .iter()
            .find(|(c, _)| *c == command)
            .map(|(_, error)| *error);
        let response = match rejection {
            Some(error) => vec![PID_ERR, error],
            None => {
                state.commands.push(command);
                self.execute(&mut state, request)
            }
        };
        if state.lost_responses > 0 {
            state.lost_responses -= 1;
            return None;
        }
        Some(response)
    }

    fn execute(&self, state: &mut SimState, request: &[u8]) -> Vec<u8> {
        let config = &self.config;
        let order = config.byte_order;
        let command = request[0];

        if command != CMD_CONNECT && !state.connected {
            return vec![PID_ERR, ERR_SEQUENCE];
        }

        match command {
            CMD_CONNECT => {
                state.connected = true;
                state.programming = false;
                let resource = if config.programming { RESOURCE_PGM } else { 0 };
                let comm_mode = match order {
                    Endianness::Intel => 0,
                    Endianness::Motorola => COMM_MODE_BYTE_ORDER,
                };
                let max_dto = match order {
                    Endianness::Intel => [config.max_cto, 0],
                    Endianness::Motorola => [0, config.max_cto],
                };
                vec![
                    PID_RES, resource, comm_mode, config.max_cto, max_dto[0], max_dto[1], 1, 1,
                ]
            }
            CMD_DISCONNECT => {
                state.connected = false;
                state.programming = false;
                vec![PID_RES]
            }
            CMD_SET_MTA => {
                if request.len() < 8 {
                    return vec![PID_ERR, ERR_CMD_SYNTAX];
                }
                state.mta = order.read_u32(&request[4..8]);
                vec![PID_RES]
            }
            CMD_UPLOAD => {
                let len = request.get(1).copied().unwrap_or(0) as usize;
                if len == 0 || len > (config.max_cto as usize).saturating_sub(1) {
                    return vec![PID_ERR, ERR_CMD_SYNTAX];
                }
                let mut response = vec![PID_RES];
                response.extend(read_memory(&state.memory, state.mta, len));
                state.mta = state.mta.wrapping_add(len as u32);
                response
            }
            CMD_PROGRAM_START => {
                state.programming = true;
                vec![PID_RES, 0, 0, config.max_cto_pgm, 0, 0, 0]
            }
            CMD_PROGRAM_CLEAR => {
                if !state.programming {
                    return vec![PID_ERR, ERR_SEQUENCE];
                }
                if request.len() < 8 {
                    return vec![PID_ERR, ERR_CMD_SYNTAX];
                }
                let len = order.read_u32(&request[4..8]);
                let range = state.mta as u64..state.mta as u64 + len as u64;
                if !self.in_flash(&range) {
                    return vec![PID_ERR, ERR_OUT_OF_RANGE];
                }
                let block = config.erase_block.max(1) as u64;
                let start = (range.start / block * block) as u32;
                let end = range.end.div_ceil(block) * block;
                let keys: Vec<u32> = state
                    .memory
                    .range(start..)
                    .map(|(k, _)| *k)
                    .take_while(|k| (*k as u64) < end)
                    .collect();
                for key in keys {
                    state.memory.remove(&key);
                }
                vec![PID_RES]
            }
            CMD_PROGRAM => {
                if !state.programming {
                    return vec![PID_ERR, ERR_SEQUENCE];
                }
                let len = request.get(1).copied().unwrap_or(0) as usize;
                let max_cto = match config.max_cto_pgm {
                    0 => config.max_cto,
                    n => n,
                } as usize;
                if len > max_cto.saturating_sub(2) || request.len() < len + 2 {
                    return vec![PID_ERR, ERR_CMD_SYNTAX];
                }
                if len == 0 {
                    return vec![PID_RES];
                }
                let range = state.mta as u64..state.mta as u64 + len as u64;
                if !self.in_flash(&range) {
                    return vec![PID_ERR, ERR_OUT_OF_RANGE];
                }
                for (i, b) in request[2..2 + len].iter().enumerate() {
                    state.memory.insert(state.mta + i as u32, *b);
                }
                state.mta = state.mta.wrapping_add(len as u32);
                vec![PID_RES]
            }
            CMD_PROGRAM_RESET => {
                state.connected = false;
                state.programming = false;
                state.resets += 1;
                vec![PID_RES]
            }
            _ => vec![PID_ERR, ERR_CMD_UNKNOWN],
        }
    }

    fn in_flash(&self, range: &Range<u64>) -> bool {
        range.start >= self.config.flash.start && range.end <= self.config.flash.end
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SimTarget {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

fn read_memory(memory: &BTreeMap<u32, u8>, address: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let addr = address.wrapping_add(i as u32);
            memory.get(&addr).copied().unwrap_or(0xFF)
        })
        .collect()
}
