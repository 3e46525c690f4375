// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bit-level access to RBSP data.
//!
//! NAL payloads are unescaped into an owned RBSP buffer first
//! ([`nal_to_rbsp`]), then read sequentially with [`BitReader`]. Running out
//! of bits is a hard error so that truncated parameter sets fail instead of
//! yielding zero-valued fields.

use anyhow::anyhow;
use thiserror::Error;

/// Size of the nal_unit_header() in bytes. See 7.3.1.2.
pub const NAL_HEADER_SIZE: usize = 2;

#[derive(Debug, Error)]
pub enum BitReaderError {
    #[error("reader ran out of bits")]
    OutOfBits,
    #[error("more than 31 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("failed to convert read input to target type")]
    ConversionFailed,
}

/// An MSB-first bit cursor over one RBSP buffer.
///
/// Single pass; re-create the reader to parse the buffer again.
pub struct BitReader<'a> {
    data: &'a [u8],
    /// Position of the next unread bit, from the start of `data`.
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> Result<bool, BitReaderError> {
        let bit = self.read_bits::<u32>(1)?;
        Ok(bit == 1)
    }

    /// Read up to 31 bits from the stream.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U, BitReaderError> {
        if num_bits > 31 {
            return Err(BitReaderError::TooManyBitsRequested(num_bits));
        }
        if self.num_bits_left() < num_bits {
            return Err(BitReaderError::OutOfBits);
        }

        let mut out: u32 = 0;
        for _ in 0..num_bits {
            let byte = self.data[self.pos / 8];
            let bit = (byte >> (7 - self.pos % 8)) & 1;
            out = (out << 1) | u32::from(bit);
            self.pos += 1;
        }

        U::try_from(out).map_err(|_| BitReaderError::ConversionFailed)
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, num_bits: usize) -> Result<(), BitReaderError> {
        if self.num_bits_left() < num_bits {
            return Err(BitReaderError::OutOfBits);
        }
        self.pos += num_bits;
        Ok(())
    }

    /// Returns the amount of bits left in the stream.
    pub fn num_bits_left(&self) -> usize {
        self.data.len() * 8 - self.pos
    }

    /// Read an unsigned Exp-Golomb coded value (ue(v), 9.2).
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> anyhow::Result<U> {
        let mut leading_zeros = 0;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(anyhow!("invalid exp-golomb code"));
            }
        }

        let mut value = (1u32 << leading_zeros) - 1;
        if leading_zeros > 0 {
            value += self.read_bits::<u32>(leading_zeros)?;
        }

        U::try_from(value).map_err(|_| anyhow!("conversion error"))
    }

    pub fn read_ue_bounded<U: TryFrom<u32>>(&mut self, min: u32, max: u32) -> anyhow::Result<U> {
        let ue: u32 = self.read_ue()?;
        if ue < min || ue > max {
            return Err(anyhow!(
                "value out of bounds: expected {} - {}, got {}",
                min,
                max,
                ue
            ));
        }
        U::try_from(ue).map_err(|_| anyhow!("conversion error"))
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> anyhow::Result<U> {
        self.read_ue_bounded(0, max)
    }

    /// Read a signed Exp-Golomb coded value (se(v), 9.2.2).
    pub fn read_se<U: TryFrom<i32>>(&mut self) -> anyhow::Result<U> {
        let ue: u32 = self.read_ue()?;

        // (9-6)
        let value = if ue % 2 == 1 {
            (ue / 2 + 1) as i64
        } else {
            -((ue / 2) as i64)
        };

        let value = i32::try_from(value).map_err(|_| anyhow!("invalid se(v) code"))?;
        U::try_from(value).map_err(|_| anyhow!("conversion error"))
    }

    pub fn read_se_bounded<U: TryFrom<i32>>(&mut self, min: i32, max: i32) -> anyhow::Result<U> {
        let se: i32 = self.read_se()?;
        if se < min || se > max {
            return Err(anyhow!(
                "value out of bounds: expected {} - {}, got {}",
                min,
                max,
                se
            ));
        }
        U::try_from(se).map_err(|_| anyhow!("conversion error"))
    }
}

/// Unescapes a raw NAL payload into an owned RBSP buffer.
///
/// The two header bytes are dropped, and so is every emulation prevention
/// byte, i.e. any 0x03 immediately following two zero bytes. Finding one
/// resets the lookback window: 0x00 0x00 0x03 0x03 keeps the second 0x03.
pub fn nal_to_rbsp(nal: &[u8]) -> anyhow::Result<Vec<u8>> {
    if nal.len() < NAL_HEADER_SIZE {
        return Err(anyhow!("NAL unit too small: {} byte(s)", nal.len()));
    }

    let mut rbsp = Vec::with_capacity(nal.len() - NAL_HEADER_SIZE);
    let mut last_two_bytes = 0xffffu32;

    for &byte in &nal[NAL_HEADER_SIZE..] {
        if (last_two_bytes & 0xffff) == 0 && byte == 0x03 {
            // Skip the emulation prevention byte and require another two
            // zero bytes before the next one.
            last_two_bytes = 0xffff;
            continue;
        }
        rbsp.push(byte);
        last_two_bytes = (last_two_bytes << 8) | u32::from(byte);
    }

    Ok(rbsp)
}
