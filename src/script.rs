//! Built-in script evaluation: instruction parsing, locking-script
//! classification, signature-operation counting, legacy signature hashing
//! and a stack interpreter.

use crate::constants::*;
use crate::error::ScriptError;
use crate::script_check::{ScriptCheck, ScriptVerifier};
use crate::serialization::{hash160, serialize_transaction, sha256d};
use crate::types::*;
use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};
use sha2::{Digest, Sha256};
use std::time::Instant;

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_NOP: u8 = 0x61;
pub const OP_IF: u8 = 0x63;
pub const OP_NOTIF: u8 = 0x64;
pub const OP_VERIF: u8 = 0x65;
pub const OP_VERNOTIF: u8 = 0x66;
pub const OP_ELSE: u8 = 0x67;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_VERIFY: u8 = 0x69;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_TOALTSTACK: u8 = 0x6b;
pub const OP_FROMALTSTACK: u8 = 0x6c;
pub const OP_2DROP: u8 = 0x6d;
pub const OP_2DUP: u8 = 0x6e;
pub const OP_IFDUP: u8 = 0x73;
pub const OP_DEPTH: u8 = 0x74;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_NIP: u8 = 0x77;
pub const OP_OVER: u8 = 0x78;
pub const OP_PICK: u8 = 0x79;
pub const OP_ROLL: u8 = 0x7a;
pub const OP_SWAP: u8 = 0x7c;
pub const OP_TUCK: u8 = 0x7d;
pub const OP_SIZE: u8 = 0x82;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_1ADD: u8 = 0x8b;
pub const OP_1SUB: u8 = 0x8c;
pub const OP_NEGATE: u8 = 0x8f;
pub const OP_ABS: u8 = 0x90;
pub const OP_NOT: u8 = 0x91;
pub const OP_0NOTEQUAL: u8 = 0x92;
pub const OP_ADD: u8 = 0x93;
pub const OP_SUB: u8 = 0x94;
pub const OP_BOOLAND: u8 = 0x9a;
pub const OP_BOOLOR: u8 = 0x9b;
pub const OP_NUMEQUAL: u8 = 0x9c;
pub const OP_NUMEQUALVERIFY: u8 = 0x9d;
pub const OP_NUMNOTEQUAL: u8 = 0x9e;
pub const OP_LESSTHAN: u8 = 0x9f;
pub const OP_GREATERTHAN: u8 = 0xa0;
pub const OP_LESSTHANOREQUAL: u8 = 0xa1;
pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;
pub const OP_MIN: u8 = 0xa3;
pub const OP_MAX: u8 = 0xa4;
pub const OP_WITHIN: u8 = 0xa5;
pub const OP_RIPEMD160: u8 = 0xa6;
pub const OP_SHA256: u8 = 0xa8;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_HASH256: u8 = 0xaa;
pub const OP_CODESEPARATOR: u8 = 0xab;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
pub const OP_NOP1: u8 = 0xb0;
pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
pub const OP_NOP10: u8 = 0xb9;

const SIGHASH_NONE: u32 = 0x02;
const SIGHASH_SINGLE: u32 = 0x03;
const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// One parsed script element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction<'a> {
    /// Data push (OP_0, direct pushes and OP_PUSHDATA1/2/4)
    Push(&'a [u8]),
    Op(u8),
}

/// Iterator over the instructions of a script. Yields an error and stops on
/// a truncated push.
pub struct Instructions<'a> {
    script: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> Instructions<'a> {
    pub fn new(script: &'a [u8]) -> Self {
        Instructions { script, pos: 0, failed: false }
    }

    /// Byte offset of the next instruction.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let data = self.script.get(self.pos..end)?;
        self.pos = end;
        Some(data)
    }

    fn take_len(&mut self, width: usize) -> Option<usize> {
        let bytes = self.take(width)?;
        let mut buf = [0u8; 4];
        buf[..width].copy_from_slice(bytes);
        Some(u32::from_le_bytes(buf) as usize)
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, ScriptError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.script.len() {
            return None;
        }
        let opcode = self.script[self.pos];
        self.pos += 1;

        let len = match opcode {
            0x01..=0x4b => Some(opcode as usize),
            OP_PUSHDATA1 => self.take_len(1),
            OP_PUSHDATA2 => self.take_len(2),
            OP_PUSHDATA4 => self.take_len(4),
            OP_0 => return Some(Ok(Instruction::Push(&[]))),
            _ => return Some(Ok(Instruction::Op(opcode))),
        };

        match len.and_then(|len| self.take(len)) {
            Some(data) => Some(Ok(Instruction::Push(data))),
            None => {
                self.failed = true;
                Some(Err(ScriptError::BadPush))
            }
        }
    }
}

/// Append the shortest push of `data`.
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0..=0x4b => script.push(data.len() as u8),
        0x4c..=0xff => {
            script.push(OP_PUSHDATA1);
            script.push(data.len() as u8);
        }
        0x100..=0xffff => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(data.len() as u16).to_le_bytes());
        }
        _ => {
            script.push(OP_PUSHDATA4);
            script.extend_from_slice(&(data.len() as u32).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
}

/// Append an integer the way script number pushes are canonically written:
/// small integers as OP_0, OP_1NEGATE or OP_1..OP_16, others as data.
pub fn push_int(script: &mut Vec<u8>, n: i64) {
    match n {
        0 => script.push(OP_0),
        -1 => script.push(OP_1NEGATE),
        1..=16 => script.push(OP_1 + (n as u8) - 1),
        _ => push_data(script, &encode_num(n)),
    }
}

pub fn is_push_only(script: &[u8]) -> bool {
    Instructions::new(script).all(|ins| match ins {
        Ok(Instruction::Push(_)) => true,
        Ok(Instruction::Op(op)) => op <= OP_16,
        Err(_) => false,
    })
}

/// Locking-script template. Evaluation dispatches on this discriminant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptKind {
    PayToPubkeyHash([u8; 20]),
    PayToScriptHash([u8; 20]),
    PayToPubkey(Vec<u8>),
    NullData,
    NonStandard,
}

impl ScriptKind {
    pub fn classify(script: &[u8]) -> ScriptKind {
        match script {
            [OP_DUP, OP_HASH160, 0x14, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
                ScriptKind::PayToPubkeyHash(to_array20(hash))
            }
            [OP_HASH160, 0x14, hash @ .., OP_EQUAL] if hash.len() == 20 => {
                ScriptKind::PayToScriptHash(to_array20(hash))
            }
            [0x21, key @ .., OP_CHECKSIG] if key.len() == 33 => ScriptKind::PayToPubkey(key.to_vec()),
            [0x41, key @ .., OP_CHECKSIG] if key.len() == 65 => ScriptKind::PayToPubkey(key.to_vec()),
            [OP_RETURN, rest @ ..] if is_push_only(rest) => ScriptKind::NullData,
            _ => ScriptKind::NonStandard,
        }
    }

    pub fn is_standard(&self) -> bool {
        !matches!(self, ScriptKind::NonStandard)
    }
}

fn to_array20(bytes: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(bytes);
    out
}

pub fn p2pkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = vec![OP_DUP, OP_HASH160, 0x14];
    script.extend_from_slice(pubkey_hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

pub fn p2sh_script(script_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = vec![OP_HASH160, 0x14];
    script.extend_from_slice(script_hash);
    script.push(OP_EQUAL);
    script
}

/// Outputs beginning with OP_RETURN can never be spent and are kept out of
/// the UTXO set.
pub fn is_unspendable(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN) || script.len() > MAX_SCRIPT_SIZE
}

/// Count signature operations.
///
/// CHECKSIG counts 1. CHECKMULTISIG counts 20, or the preceding OP_N key
/// count when `accurate` is set. Counting stops at a malformed push.
pub fn count_sigops(script: &[u8], accurate: bool) -> usize {
    let mut count = 0;
    let mut last_op = None;
    for ins in Instructions::new(script) {
        let op = match ins {
            Ok(Instruction::Op(op)) => op,
            Ok(Instruction::Push(_)) => {
                last_op = None;
                continue;
            }
            Err(_) => break,
        };
        match op {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => match last_op {
                Some(n @ OP_1..=OP_16) if accurate => count += (n - OP_1 + 1) as usize,
                _ => count += MULTISIG_SIGOPS,
            },
            _ => {}
        }
        last_op = Some(op);
    }
    count
}

/// Sigops hidden in the redeem script of a pay-to-script-hash spend.
pub fn count_p2sh_sigops(script_sig: &[u8], prev_script: &[u8]) -> usize {
    if !matches!(ScriptKind::classify(prev_script), ScriptKind::PayToScriptHash(_)) {
        return 0;
    }
    if !is_push_only(script_sig) {
        return 0;
    }
    let redeem = Instructions::new(script_sig)
        .filter_map(|ins| match ins {
            Ok(Instruction::Push(data)) => Some(data),
            _ => None,
        })
        .last();
    redeem.map(|r| count_sigops(r, true)).unwrap_or(0)
}

/// Legacy signature hash.
///
/// 1. Copy the transaction; blank every unlocking script and place
///    `script_code` at `input_index`
/// 2. SIGHASH_NONE drops all outputs, SIGHASH_SINGLE keeps outputs up to
///    the signed index (blanking earlier ones); both zero other sequences
/// 3. ANYONECANPAY keeps only the signed input
/// 4. Return sha256d(serialized copy || hash_type as u32 LE)
pub fn legacy_signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    hash_type: u32,
) -> Hash {
    let base = hash_type & 0x1f;
    if base == SIGHASH_SINGLE && input_index >= tx.outputs.len() {
        let mut one = [0u8; 32];
        one[0] = 1;
        return one;
    }

    let mut copy = tx.clone();
    for (i, input) in copy.inputs.iter_mut().enumerate() {
        input.script_sig = if i == input_index { script_code.to_vec() } else { Vec::new() };
    }

    if base == SIGHASH_NONE || base == SIGHASH_SINGLE {
        if base == SIGHASH_NONE {
            copy.outputs.clear();
        } else {
            copy.outputs.truncate(input_index + 1);
            for output in copy.outputs.iter_mut().take(input_index) {
                output.value = -1;
                output.script_pubkey.clear();
            }
        }
        for (i, input) in copy.inputs.iter_mut().enumerate() {
            if i != input_index {
                input.sequence = 0;
            }
        }
    }

    if hash_type & SIGHASH_ANYONECANPAY != 0 {
        let signed = copy.inputs.swap_remove(input_index);
        copy.inputs = vec![signed];
    }

    let mut bytes = serialize_transaction(&copy);
    bytes.extend_from_slice(&hash_type.to_le_bytes());
    sha256d(&bytes)
}

pub fn decode_num(bytes: &[u8], max_len: usize) -> Result<i64, ScriptError> {
    if bytes.len() > max_len {
        return Err(ScriptError::NumOverflow);
    }
    let Some(&last) = bytes.last() else {
        return Ok(0);
    };
    let mut result = 0i64;
    for (i, byte) in bytes.iter().enumerate() {
        result |= (*byte as i64) << (8 * i);
    }
    if last & 0x80 != 0 {
        let mask = !(0x80i64 << (8 * (bytes.len() - 1)));
        return Ok(-(result & mask));
    }
    Ok(result)
}

pub fn encode_num(n: i64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    let negative = n < 0;
    let mut abs = n.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let last = out.len() - 1;
    if out[last] & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        out[last] |= 0x80;
    }
    out
}

pub fn cast_to_bool(bytes: &[u8]) -> bool {
    for (i, &b) in bytes.iter().enumerate() {
        if b != 0 {
            // negative zero
            return !(i == bytes.len() - 1 && b == 0x80);
        }
    }
    false
}

fn is_disabled(op: u8) -> bool {
    matches!(op, 0x7e..=0x81 | 0x83..=0x86 | 0x8d | 0x8e | 0x95..=0x99 | OP_VERIF | OP_VERNOTIF)
}

/// Inputs available to a running script.
pub struct ExecContext<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub flags: u32,
    pub deadline: Instant,
    pub secp: &'a Secp256k1<VerifyOnly>,
}

/// Stack machine for one input. The main stack persists across `eval`
/// calls so the unlocking script's results feed the locking script.
pub struct Interpreter<'a> {
    ctx: &'a ExecContext<'a>,
    pub stack: Vec<Vec<u8>>,
}

fn bool_item(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

impl<'a> Interpreter<'a> {
    pub fn new(ctx: &'a ExecContext<'a>) -> Self {
        Interpreter { ctx, stack: Vec::new() }
    }

    /// Non-empty stack with a true top element.
    pub fn succeeded(&self) -> bool {
        self.stack.last().map(|top| cast_to_bool(top)).unwrap_or(false)
    }

    fn pop(&mut self) -> Result<Vec<u8>, ScriptError> {
        self.stack.pop().ok_or(ScriptError::InvalidStackOperation)
    }

    fn pop_num(&mut self) -> Result<i64, ScriptError> {
        let item = self.pop()?;
        decode_num(&item, 4)
    }

    fn peek(&self, depth: usize) -> Result<&Vec<u8>, ScriptError> {
        self.stack
            .len()
            .checked_sub(depth)
            .and_then(|i| self.stack.get(i))
            .ok_or(ScriptError::InvalidStackOperation)
    }

    pub fn eval(&mut self, script: &[u8]) -> Result<(), ScriptError> {
        if script.len() > MAX_SCRIPT_SIZE {
            return Err(ScriptError::ScriptSize(script.len()));
        }

        let mut alt: Vec<Vec<u8>> = Vec::new();
        let mut exec: Vec<bool> = Vec::new();
        let mut op_count = 0usize;
        let mut code_start = 0usize;
        let mut instructions = Instructions::new(script);

        while let Some(ins) = instructions.next() {
            if Instant::now() > self.ctx.deadline {
                return Err(ScriptError::Timeout);
            }
            let executing = exec.iter().all(|&b| b);

            match ins? {
                Instruction::Push(data) => {
                    if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
                        return Err(ScriptError::PushSize);
                    }
                    if executing {
                        self.stack.push(data.to_vec());
                    }
                }
                Instruction::Op(op) => {
                    if op > OP_16 {
                        op_count += 1;
                        if op_count > MAX_SCRIPT_OPS {
                            return Err(ScriptError::OpCount);
                        }
                    }
                    if is_disabled(op) {
                        return Err(ScriptError::BadOpcode(op));
                    }

                    match op {
                        OP_IF | OP_NOTIF => {
                            let mut value = false;
                            if executing {
                                let item = self.pop()?;
                                value = cast_to_bool(&item) == (op == OP_IF);
                            }
                            exec.push(value);
                        }
                        OP_ELSE => {
                            let last = exec.last_mut().ok_or(ScriptError::UnbalancedConditional)?;
                            *last = !*last;
                        }
                        OP_ENDIF => {
                            exec.pop().ok_or(ScriptError::UnbalancedConditional)?;
                        }
                        _ if !executing => {}
                        OP_CODESEPARATOR => code_start = instructions.position(),
                        OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                            let ok = self.check_multisig(&script[code_start..], &mut op_count)?;
                            if op == OP_CHECKMULTISIGVERIFY {
                                if !ok {
                                    return Err(ScriptError::Verify);
                                }
                            } else {
                                self.stack.push(bool_item(ok));
                            }
                        }
                        _ => self.execute(op, &mut alt, &script[code_start..])?,
                    }
                }
            }

            if self.stack.len() + alt.len() > MAX_STACK_SIZE {
                return Err(ScriptError::StackSize);
            }
        }

        if !exec.is_empty() {
            return Err(ScriptError::UnbalancedConditional);
        }
        Ok(())
    }

    fn execute(&mut self, op: u8, alt: &mut Vec<Vec<u8>>, script_code: &[u8]) -> Result<(), ScriptError> {
        match op {
            OP_1NEGATE => self.stack.push(encode_num(-1)),
            OP_1..=OP_16 => self.stack.push(encode_num((op - OP_1 + 1) as i64)),
            OP_NOP | OP_NOP1 | 0xb2..=OP_NOP10 => {}
            OP_CHECKLOCKTIMEVERIFY => {
                if self.ctx.flags & SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY != 0 {
                    self.check_lock_time()?;
                }
            }
            OP_VERIFY => {
                let item = self.pop()?;
                if !cast_to_bool(&item) {
                    return Err(ScriptError::Verify);
                }
            }
            OP_RETURN => return Err(ScriptError::OpReturn),

            OP_TOALTSTACK => {
                let item = self.pop()?;
                alt.push(item);
            }
            OP_FROMALTSTACK => {
                let item = alt.pop().ok_or(ScriptError::InvalidStackOperation)?;
                self.stack.push(item);
            }
            OP_2DROP => {
                self.pop()?;
                self.pop()?;
            }
            OP_2DUP => {
                let a = self.peek(2)?.clone();
                let b = self.peek(1)?.clone();
                self.stack.push(a);
                self.stack.push(b);
            }
            OP_IFDUP => {
                let top = self.peek(1)?.clone();
                if cast_to_bool(&top) {
                    self.stack.push(top);
                }
            }
            OP_DEPTH => self.stack.push(encode_num(self.stack.len() as i64)),
            OP_DROP => {
                self.pop()?;
            }
            OP_DUP => {
                let top = self.peek(1)?.clone();
                self.stack.push(top);
            }
            OP_NIP => {
                let top = self.pop()?;
                self.pop()?;
                self.stack.push(top);
            }
            OP_OVER => {
                let second = self.peek(2)?.clone();
                self.stack.push(second);
            }
            OP_PICK | OP_ROLL => {
                let n = self.pop_num()?;
                if n < 0 || n as usize >= self.stack.len() {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let index = self.stack.len() - 1 - n as usize;
                let item = if op == OP_ROLL {
                    self.stack.remove(index)
                } else {
                    self.stack[index].clone()
                };
                self.stack.push(item);
            }
            OP_SWAP => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                self.stack.swap(len - 1, len - 2);
            }
            OP_TUCK => {
                let top = self.peek(1)?.clone();
                let len = self.stack.len();
                if len < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                self.stack.insert(len - 2, top);
            }
            OP_SIZE => {
                let size = self.peek(1)?.len();
                self.stack.push(encode_num(size as i64));
            }

            OP_EQUAL | OP_EQUALVERIFY => {
                let a = self.pop()?;
                let b = self.pop()?;
                if op == OP_EQUALVERIFY {
                    if a != b {
                        return Err(ScriptError::Verify);
                    }
                } else {
                    self.stack.push(bool_item(a == b));
                }
            }

            OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                let n = self.pop_num()?;
                let result = match op {
                    OP_1ADD => n + 1,
                    OP_1SUB => n - 1,
                    OP_NEGATE => -n,
                    OP_ABS => n.abs(),
                    OP_NOT => (n == 0) as i64,
                    _ => (n != 0) as i64,
                };
                self.stack.push(encode_num(result));
            }
            OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMEQUALVERIFY
            | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL
            | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                let b = self.pop_num()?;
                let a = self.pop_num()?;
                let result = match op {
                    OP_ADD => a + b,
                    OP_SUB => a - b,
                    OP_BOOLAND => (a != 0 && b != 0) as i64,
                    OP_BOOLOR => (a != 0 || b != 0) as i64,
                    OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                    OP_NUMNOTEQUAL => (a != b) as i64,
                    OP_LESSTHAN => (a < b) as i64,
                    OP_GREATERTHAN => (a > b) as i64,
                    OP_LESSTHANOREQUAL => (a <= b) as i64,
                    OP_GREATERTHANOREQUAL => (a >= b) as i64,
                    OP_MIN => a.min(b),
                    _ => a.max(b),
                };
                if op == OP_NUMEQUALVERIFY {
                    if result == 0 {
                        return Err(ScriptError::Verify);
                    }
                } else {
                    self.stack.push(encode_num(result));
                }
            }
            OP_WITHIN => {
                let max = self.pop_num()?;
                let min = self.pop_num()?;
                let x = self.pop_num()?;
                self.stack.push(bool_item(min <= x && x < max));
            }

            OP_RIPEMD160 => {
                let item = self.pop()?;
                self.stack.push(Ripemd160::digest(&item).to_vec());
            }
            OP_SHA256 => {
                let item = self.pop()?;
                self.stack.push(Sha256::digest(&item).to_vec());
            }
            OP_HASH160 => {
                let item = self.pop()?;
                self.stack.push(hash160(&item).to_vec());
            }
            OP_HASH256 => {
                let item = self.pop()?;
                self.stack.push(sha256d(&item).to_vec());
            }
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                let pubkey = self.pop()?;
                let sig = self.pop()?;
                let ok = check_signature(&sig, &pubkey, script_code, self.ctx)?;
                if op == OP_CHECKSIGVERIFY {
                    if !ok {
                        return Err(ScriptError::Verify);
                    }
                } else {
                    self.stack.push(bool_item(ok));
                }
            }

            other => return Err(ScriptError::BadOpcode(other)),
        }
        Ok(())
    }

    /// m-of-n signature check. Signatures must appear in key order; an extra
    /// element below the signatures is consumed.
    fn check_multisig(&mut self, script_code: &[u8], op_count: &mut usize) -> Result<bool, ScriptError> {
        let key_count = self.pop_num()?;
        if !(0..=20).contains(&key_count) {
            return Err(ScriptError::PubkeyCount);
        }
        *op_count += key_count as usize;
        if *op_count > MAX_SCRIPT_OPS {
            return Err(ScriptError::OpCount);
        }
        let mut keys = Vec::with_capacity(key_count as usize);
        for _ in 0..key_count {
            keys.push(self.pop()?);
        }
        keys.reverse();

        let sig_count = self.pop_num()?;
        if sig_count < 0 || sig_count > key_count {
            return Err(ScriptError::SigCount);
        }
        let mut sigs = Vec::with_capacity(sig_count as usize);
        for _ in 0..sig_count {
            sigs.push(self.pop()?);
        }
        sigs.reverse();
        self.pop()?;

        let mut key_iter = keys.iter();
        for sig in &sigs {
            let mut matched = false;
            for key in key_iter.by_ref() {
                if check_signature(sig, key, script_code, self.ctx)? {
                    matched = true;
                    break;
                }
            }
            if !matched {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn check_lock_time(&self) -> Result<(), ScriptError> {
        let top = self.peek(1)?;
        let required = decode_num(top, 5)?;
        if required < 0 {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        let tx_lock_time = self.ctx.tx.lock_time as i64;
        let threshold = LOCKTIME_THRESHOLD as i64;
        let same_kind = (tx_lock_time < threshold) == (required < threshold);
        let sequence = self.ctx.tx.inputs[self.ctx.input_index].sequence;
        if !same_kind || required > tx_lock_time || sequence == SEQUENCE_FINAL {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        Ok(())
    }
}

fn is_valid_pubkey_encoding(pubkey: &[u8]) -> bool {
    match pubkey.first() {
        Some(0x02) | Some(0x03) => pubkey.len() == 33,
        Some(0x04) => pubkey.len() == 65,
        _ => false,
    }
}

/// Verify one signature (DER plus trailing hash-type byte) against a public
/// key over the legacy signature hash.
pub fn check_signature(
    sig: &[u8],
    pubkey: &[u8],
    script_code: &[u8],
    ctx: &ExecContext<'_>,
) -> Result<bool, ScriptError> {
    let Some((&hash_type, der)) = sig.split_last() else {
        return Ok(false);
    };
    let strict = ctx.flags & SCRIPT_VERIFY_STRICTENC != 0;
    if strict {
        let base = hash_type & !(SIGHASH_ANYONECANPAY as u8);
        if !(SIGHASH_ALL..=SIGHASH_SINGLE as u8).contains(&base) {
            return Err(ScriptError::SigHashType(hash_type));
        }
        if !is_valid_pubkey_encoding(pubkey) {
            return Err(ScriptError::PubkeyEncoding);
        }
    }

    let mut signature = if ctx.flags & (SCRIPT_VERIFY_DERSIG | SCRIPT_VERIFY_STRICTENC) != 0 {
        Signature::from_der(der).map_err(|_| ScriptError::SigEncoding)?
    } else {
        match Signature::from_der_lax(der) {
            Ok(sig) => sig,
            Err(_) => return Ok(false),
        }
    };
    signature.normalize_s();

    let key = match PublicKey::from_slice(pubkey) {
        Ok(key) => key,
        Err(_) => return Ok(false),
    };

    let digest = legacy_signature_hash(ctx.tx, ctx.input_index, script_code, hash_type as u32);
    let message = match Message::from_digest_slice(&digest) {
        Ok(m) => m,
        Err(_) => return Ok(false),
    };
    Ok(ctx.secp.verify_ecdsa(&message, &signature, &key).is_ok())
}

/// Items pushed by a push-only script, or `None` if it contains other opcodes.
fn push_items(script: &[u8]) -> Option<Vec<&[u8]>> {
    Instructions::new(script)
        .map(|ins| match ins {
            Ok(Instruction::Push(data)) => Some(data),
            _ => None,
        })
        .collect()
}

/// Script verifier covering the standard templates plus a generic
/// interpreter for everything else.
pub struct StandardVerifier {
    secp: Secp256k1<VerifyOnly>,
}

impl Default for StandardVerifier {
    fn default() -> Self {
        StandardVerifier { secp: Secp256k1::verification_only() }
    }
}

impl StandardVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn verify_generic(&self, unlocking: &[u8], locking: &[u8], ctx: &ExecContext<'_>) -> Result<bool, ScriptError> {
        let mut interpreter = Interpreter::new(ctx);
        interpreter.eval(unlocking)?;
        interpreter.eval(locking)?;
        Ok(interpreter.succeeded())
    }

    fn verify_p2pkh(
        &self,
        hash: &[u8; 20],
        unlocking: &[u8],
        locking: &[u8],
        ctx: &ExecContext<'_>,
    ) -> Result<bool, ScriptError> {
        match push_items(unlocking).as_deref() {
            Some([sig, pubkey]) => {
                if hash160(pubkey) != *hash {
                    return Ok(false);
                }
                check_signature(sig, pubkey, locking, ctx)
            }
            _ => self.verify_generic(unlocking, locking, ctx),
        }
    }

    fn verify_p2pk(
        &self,
        pubkey: &[u8],
        unlocking: &[u8],
        locking: &[u8],
        ctx: &ExecContext<'_>,
    ) -> Result<bool, ScriptError> {
        match push_items(unlocking).as_deref() {
            Some([sig]) => check_signature(sig, pubkey, locking, ctx),
            _ => self.verify_generic(unlocking, locking, ctx),
        }
    }

    fn verify_p2sh(&self, hash: &[u8; 20], unlocking: &[u8], ctx: &ExecContext<'_>) -> Result<bool, ScriptError> {
        if !is_push_only(unlocking) {
            return Err(ScriptError::SigPushOnly);
        }
        let mut interpreter = Interpreter::new(ctx);
        interpreter.eval(unlocking)?;
        let redeem = match interpreter.stack.pop() {
            Some(redeem) => redeem,
            None => return Ok(false),
        };
        if hash160(&redeem) != *hash {
            return Ok(false);
        }
        interpreter.eval(&redeem)?;
        Ok(interpreter.succeeded())
    }
}

impl ScriptVerifier for StandardVerifier {
    fn verify(&self, check: &ScriptCheck<'_>, deadline: Instant) -> Result<bool, ScriptError> {
        if check.input_index >= check.tx.inputs.len() {
            return Err(ScriptError::InputIndex(check.input_index));
        }
        let ctx = ExecContext {
            tx: check.tx,
            input_index: check.input_index,
            flags: check.flags,
            deadline,
            secp: &self.secp,
        };

        match ScriptKind::classify(check.locking) {
            ScriptKind::PayToPubkeyHash(hash) => self.verify_p2pkh(&hash, check.unlocking, check.locking, &ctx),
            ScriptKind::PayToPubkey(key) => self.verify_p2pk(&key, check.unlocking, check.locking, &ctx),
            ScriptKind::PayToScriptHash(hash) if check.flags & SCRIPT_VERIFY_P2SH != 0 => {
                self.verify_p2sh(&hash, check.unlocking, &ctx)
            }
            ScriptKind::NullData => Ok(false),
            _ => self.verify_generic(check.unlocking, check.locking, &ctx),
        }
    }
}
