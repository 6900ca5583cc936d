// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./histogram_test.rs"]
mod histogram_test;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hdrhistogram::Histogram;
use hdrhistogram::serialization::{Deserializer, Serializer, V2Serializer};
use strata_common::{LossyFloatToInt, LossyIntoToFloat};

// Windows with few samples keep the raw values, which round-trip exactly through the encoding.
// Past this limit the values are folded into an hdr histogram bounded at 2 significant digits
// (worst case error 1% of the reported value).
const RAW_VALUE_LIMIT: usize = 1024;
const HISTOGRAM_SIGNIFICANT_DIGITS: u8 = 2;

const RAW_ENCODING: u8 = 0;
const HDR_ENCODING: u8 = 1;

//
// HistogramError
//

#[derive(thiserror::Error, Debug)]
pub enum HistogramError {
  #[error("encoded histogram is truncated")]
  Truncated,
  #[error("unknown histogram encoding tag {0}")]
  UnknownEncoding(u8),
  #[error("hdr deserialize error: {0}")]
  HdrDeserialize(#[from] hdrhistogram::serialization::DeserializeError),
  #[error("hdr serialize error: {0}")]
  HdrSerialize(#[from] hdrhistogram::serialization::V2SerializeError),
  #[error("hdr addition error: {0}")]
  HdrAddition(#[from] hdrhistogram::errors::AdditionError),
}

//
// DurationHistogram
//

#[derive(Debug, Default)]
enum Repr {
  #[default]
  Empty,
  Raw(Vec<u64>),
  Hdr(Box<Histogram<u64>>),
}

// Duration sample accumulator with percentile extraction. Lazily allocated: a window that never
// sees a sample holds no storage at all. Not internally thread safe; the owning MutableAggregate
// serializes access.
#[derive(Debug, Default)]
pub struct DurationHistogram {
  repr: Repr,
}

fn new_hdr() -> Box<Histogram<u64>> {
  // The significant digit constant is statically valid.
  let mut histogram = Histogram::new(HISTOGRAM_SIGNIFICANT_DIGITS).unwrap();
  histogram.auto(true);
  Box::new(histogram)
}

impl DurationHistogram {
  pub fn add_value(&mut self, duration_nanos: u64) {
    match &mut self.repr {
      Repr::Empty => self.repr = Repr::Raw(vec![duration_nanos]),
      Repr::Raw(values) => {
        values.push(duration_nanos);
        if values.len() > RAW_VALUE_LIMIT {
          let mut histogram = new_hdr();
          for value in values.iter() {
            record(&mut histogram, *value);
          }
          self.repr = Repr::Hdr(histogram);
        }
      },
      Repr::Hdr(histogram) => record(histogram, duration_nanos),
    }
  }

  pub fn merge(&mut self, other: &Self) -> Result<(), HistogramError> {
    match &other.repr {
      Repr::Empty => Ok(()),
      Repr::Raw(values) => {
        for value in values {
          self.add_value(*value);
        }
        Ok(())
      },
      Repr::Hdr(other_histogram) => {
        let histogram = self.upgrade();
        histogram.add(other_histogram.as_ref())?;
        Ok(())
      },
    }
  }

  pub fn merge_encoded(&mut self, mut encoded: &[u8]) -> Result<(), HistogramError> {
    if encoded.is_empty() {
      return Ok(());
    }
    let tag = encoded.get_u8();
    match tag {
      RAW_ENCODING => {
        if encoded.remaining() < 4 {
          return Err(HistogramError::Truncated);
        }
        let count = encoded.get_u32_le() as usize;
        if encoded.remaining() < count * 8 {
          return Err(HistogramError::Truncated);
        }
        for _ in 0 .. count {
          self.add_value(encoded.get_u64_le());
        }
        Ok(())
      },
      HDR_ENCODING => {
        let decoded: Histogram<u64> = Deserializer::new().deserialize(&mut encoded)?;
        let histogram = self.upgrade();
        histogram.add(&decoded)?;
        Ok(())
      },
      unknown => Err(HistogramError::UnknownEncoding(unknown)),
    }
  }

  // Compact encoding: one tag byte followed by either the raw values or an hdr V2 payload. An
  // empty histogram encodes to zero bytes.
  pub fn to_encoded(&self) -> Result<Bytes, HistogramError> {
    match &self.repr {
      Repr::Empty => Ok(Bytes::new()),
      Repr::Raw(values) => {
        // The raw values are a multiset; sort so equal histograms encode identically regardless
        // of merge order.
        let mut sorted = values.clone();
        sorted.sort_unstable();
        let mut buf = BytesMut::with_capacity(1 + 4 + sorted.len() * 8);
        buf.put_u8(RAW_ENCODING);
        buf.put_u32_le(sorted.len().try_into().unwrap_or(u32::MAX));
        for value in sorted {
          buf.put_u64_le(value);
        }
        Ok(buf.freeze())
      },
      Repr::Hdr(histogram) => {
        let mut payload = Vec::new();
        V2Serializer::new().serialize(histogram, &mut payload)?;
        let mut buf = BytesMut::with_capacity(1 + payload.len());
        buf.put_u8(HDR_ENCODING);
        buf.put_slice(&payload);
        Ok(buf.freeze())
      },
    }
  }

  #[must_use]
  pub fn value_at_percentile(&self, percentile: f64) -> u64 {
    match &self.repr {
      Repr::Empty => 0,
      Repr::Raw(values) => {
        let mut sorted = values.clone();
        sorted.sort_unstable();
        let rank = (percentile / 100.0 * sorted.len().lossy_to_f64())
          .ceil()
          .lossy_to_usize()
          .clamp(1, sorted.len());
        sorted[rank - 1]
      },
      Repr::Hdr(histogram) => histogram.value_at_quantile(percentile / 100.0),
    }
  }

  #[must_use]
  pub fn sample_count(&self) -> u64 {
    match &self.repr {
      Repr::Empty => 0,
      Repr::Raw(values) => values.len() as u64,
      Repr::Hdr(histogram) => histogram.len(),
    }
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.sample_count() == 0
  }

  fn upgrade(&mut self) -> &mut Histogram<u64> {
    if !matches!(self.repr, Repr::Hdr(_)) {
      let mut histogram = new_hdr();
      if let Repr::Raw(values) = &self.repr {
        for value in values {
          record(&mut histogram, *value);
        }
      }
      self.repr = Repr::Hdr(histogram);
    }
    let Repr::Hdr(histogram) = &mut self.repr else {
      unreachable!()
    };
    histogram
  }
}

fn record(histogram: &mut Histogram<u64>, value: u64) {
  // Auto-resize is enabled so this only fails on pathological values; skip the sample rather than
  // poison the window.
  if let Err(e) = histogram.record(value) {
    log::warn!("failed to record histogram value {value}: {e:?}");
  }
}
