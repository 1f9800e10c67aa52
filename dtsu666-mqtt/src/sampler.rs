//! One acquisition cycle: read every register in the map, decode it, and collect the outcome in a [`Reading`].

use std::{collections::BTreeMap, time::SystemTime};

use itertools::Itertools;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::error::{DecodeError, TransportError};
use crate::modbus::{RegisterMap, RegisterReader, RegisterSpec, MAX_READ_REGISTERS};

/// Largest run of unused registers a batch may span to avoid a second transaction.
pub const DEFAULT_MAX_GAP: u16 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Complete,
    Partial,
    Failed,
}

/// Why a field has no value this cycle.
#[derive(Clone, Debug, PartialEq)]
pub enum Fault {
    Transport {
        kind: &'static str,
        message: String,
    },
    Decode(DecodeError),
    Implausible(Decimal),
}

impl From<&TransportError> for Fault {
    fn from(error: &TransportError) -> Self {
        Fault::Transport {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Present(Decimal),
    Absent(Fault),
}

/// The outcome of one poll cycle. Built by [`Sampler::sample`], handed to the publisher, then dropped.
#[derive(Clone, Debug)]
pub struct Reading {
    pub timestamp: SystemTime,
    pub values: BTreeMap<String, Value>,
}

impl Reading {
    pub fn new(timestamp: SystemTime) -> Self {
        Self {
            timestamp,
            values: BTreeMap::new(),
        }
    }

    pub fn status(&self) -> Status {
        let present = self.present_count();
        if present == 0 {
            Status::Failed
        } else if present == self.values.len() {
            Status::Complete
        } else {
            Status::Partial
        }
    }

    pub fn get(&self, name: &str) -> Option<Decimal> {
        match self.values.get(name) {
            Some(Value::Present(value)) => Some(*value),
            _ => None,
        }
    }

    /// Fields that decoded successfully, in name order.
    pub fn present(&self) -> impl Iterator<Item = (&str, Decimal)> {
        self.values.iter().filter_map(|(name, value)| match value {
            Value::Present(value) => Some((name.as_str(), *value)),
            Value::Absent(_) => None,
        })
    }

    pub fn absent(&self) -> impl Iterator<Item = (&str, &Fault)> {
        self.values.iter().filter_map(|(name, value)| match value {
            Value::Absent(fault) => Some((name.as_str(), fault)),
            Value::Present(_) => None,
        })
    }

    pub fn present_count(&self) -> usize {
        self.present().count()
    }

    fn record(&mut self, spec: &RegisterSpec, words: &[u16]) {
        let value = match spec.decode(words) {
            Ok(value) if spec.quantity.is_plausible(value) => {
                debug!(name = %spec.name, %value, raw = ?words, "Decoded value");
                Value::Present(value)
            }
            Ok(value) => {
                warn!(name = %spec.name, %value, unit = spec.unit(), "Discarding implausible value");
                Value::Absent(Fault::Implausible(value))
            }
            Err(error) => {
                warn!(name = %spec.name, %error, raw = ?words, "Could not decode value");
                Value::Absent(Fault::Decode(error))
            }
        };
        self.values.insert(spec.name.clone(), value);
    }

    fn record_failure(&mut self, spec: &RegisterSpec, error: &TransportError) {
        self.values
            .insert(spec.name.clone(), Value::Absent(Fault::from(error)));
    }
}

/// A contiguous run of registers fetched in a single transaction, and the specs (by index into the map) it covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    pub address: u16,
    pub count: u16,
    pub specs: Vec<usize>,
}

impl Batch {
    fn single(index: usize, spec: &RegisterSpec) -> Self {
        Self {
            address: spec.address,
            count: spec.word_count(),
            specs: vec![index],
        }
    }

    fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.count)
    }

    /// Absorb `next` if it starts at or after this batch's end, within `max_gap`, and the union still fits in a
    /// single read.
    fn merge(mut self, next: Self, max_gap: u16) -> Result<Self, (Self, Self)> {
        let start = u32::from(next.address);
        let fits = start >= self.end()
            && start - self.end() <= u32::from(max_gap)
            && next.end() - u32::from(self.address) <= u32::from(MAX_READ_REGISTERS);
        if !fits {
            return Err((self, next));
        }
        self.count = (next.end() - u32::from(self.address)) as u16;
        self.specs.extend(next.specs);
        Ok(self)
    }
}

/// Greedily group the map into as few reads as the gap threshold and the per-request limit allow.
pub fn plan(map: &RegisterMap, max_gap: u16) -> Vec<Batch> {
    map.iter()
        .enumerate()
        .sorted_by_key(|(_, spec)| spec.address)
        .map(|(index, spec)| Batch::single(index, spec))
        .coalesce(|batch, next| batch.merge(next, max_gap))
        .collect()
}

/// Owns the Modbus transport and turns each call to [`Sampler::sample`] into a complete [`Reading`].
pub struct Sampler<R> {
    reader: R,
    map: RegisterMap,
    batches: Vec<Batch>,
}

impl<R: RegisterReader> Sampler<R> {
    pub fn new(reader: R, map: RegisterMap) -> Self {
        Self::with_max_gap(reader, map, DEFAULT_MAX_GAP)
    }

    pub fn with_max_gap(reader: R, map: RegisterMap, max_gap: u16) -> Self {
        let batches = plan(&map, max_gap);
        debug!(registers = map.len(), batches = batches.len(), "Planned register reads");
        Self {
            reader,
            map,
            batches,
        }
    }

    /// Poll every register once. Never fails: transport and decode problems end up as absent values.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn sample(&mut self) -> Reading {
        let specs: Vec<&RegisterSpec> = self.map.iter().collect();
        let mut reading = Reading::new(SystemTime::now());

        for batch in &self.batches {
            match self.reader.read(batch.address, batch.count).await {
                Ok(words) => {
                    for &index in &batch.specs {
                        let spec = specs[index];
                        let offset = usize::from(spec.address - batch.address);
                        let end = offset + usize::from(spec.word_count());
                        match words.get(offset..end) {
                            Some(words) => reading.record(spec, words),
                            None => reading.record(spec, &[]),
                        }
                    }
                }
                Err(error @ TransportError::Exception(_)) if batch.specs.len() > 1 => {
                    // The meter refuses the whole span, possibly because of a single unmapped register inside
                    // it. Fall back to one read per field so the rest of the batch still gets through.
                    warn!(
                        address = batch.address,
                        count = batch.count,
                        %error,
                        "Batched read rejected, reading fields individually"
                    );
                    for &index in &batch.specs {
                        let spec = specs[index];
                        match self.reader.read(spec.address, spec.word_count()).await {
                            Ok(words) => reading.record(spec, &words),
                            Err(error) => {
                                warn!(name = %spec.name, %error, "Register read failed");
                                reading.record_failure(spec, &error);
                            }
                        }
                    }
                }
                Err(error) => {
                    warn!(
                        address = batch.address,
                        count = batch.count,
                        %error,
                        "Register read failed"
                    );
                    for &index in &batch.specs {
                        reading.record_failure(specs[index], &error);
                    }
                }
            }
        }

        reading
    }
}
