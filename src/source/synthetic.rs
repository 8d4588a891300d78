use super::{action, DataSource, SourceData, SourceError, SourceOptions, Window};
use crate::matrix::DataMatrix;
use crate::protocol::RequestParams;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::f64::consts::TAU;
use std::ops::RangeInclusive;

pub const KIND: &str = "synthetic";

/// Most samples generated for a single request.
pub const MAX_SAMPLES: u64 = 10_000_000;

/// Sample indices must stay exact in both f64 and i64.
const MAX_INDEX: f64 = 9_007_199_254_740_992.0;

/// Deterministic sine-plus-noise channels.
///
/// Sample `t` of channel `c` is seeded from `(seed, c, t)` alone, so any
/// window over the same source returns identical values for shared
/// timestamps regardless of how the range is split.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    description: String,
    seed: u64,
    interval: f64,
    channels: u32,
    amplitude: f64,
    period: f64,
    noise: f64,
}

impl SyntheticSource {
    pub fn new(description: impl Into<String>, seed: u64, interval: f64, channels: u32) -> Self {
        SyntheticSource {
            description: description.into(),
            seed,
            interval,
            channels: channels.max(1),
            amplitude: 1.0,
            period: 3_600.0,
            noise: 0.1,
        }
    }

    /// Options: `seed`, `interval`, `channels`, `amplitude`, `period`, `noise`.
    pub fn from_options(name: &str, description: &str, table: &toml::Table) -> Result<Self, SourceError> {
        let options = SourceOptions::new(name, table);
        let interval = options.positive("interval", options.f64_or("interval", 60.0)?)?;
        let channels = options.u64_or("channels", 4)?;
        let mut source = SyntheticSource::new(
            description,
            options.u64_or("seed", 0)?,
            interval,
            u32::try_from(channels).unwrap_or(u32::MAX),
        );
        source.amplitude = options.f64_or("amplitude", source.amplitude)?;
        source.period = options.positive("period", options.f64_or("period", source.period)?)?;
        source.noise = options.f64_or("noise", source.noise)?;
        Ok(source)
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    /// Sample indices inside the window, aligned to multiples of the interval.
    fn sample_range(&self, window: &Window) -> Result<RangeInclusive<i64>, SourceError> {
        let first = (window.start / self.interval).ceil();
        let last = (window.end / self.interval).floor();
        let in_range = |i: f64| i.is_finite() && i.abs() <= MAX_INDEX;
        if !in_range(first) || !in_range(last) || last - first + 1.0 > MAX_SAMPLES as f64 {
            return Err(SourceError::WindowTooLarge {
                start: window.start,
                end: window.end,
                limit: MAX_SAMPLES,
            });
        }
        Ok(first as i64..=last as i64)
    }

    fn sample_count(range: &RangeInclusive<i64>) -> usize {
        (range.end() - range.start() + 1).max(0) as usize
    }

    fn sample(&self, channel: u32, index: i64) -> f64 {
        let t = index as f64 * self.interval;
        let phase = channel as f64 * TAU / self.channels as f64;
        let mut rng = ChaCha8Rng::seed_from_u64(
            self.seed ^ ((channel as u64) << 48) ^ (index as u64),
        );
        let jitter: f64 = rng.gen_range(-1.0..=1.0);
        self.amplitude * (TAU * t / self.period + phase).sin() + self.noise * jitter
    }

    /// Parse `ch=1,3`. Defaults to channel 1.
    fn channels_of(&self, params: &RequestParams) -> Result<Vec<u32>, SourceError> {
        let raw = params.get("ch").unwrap_or("1");
        raw.split(',')
            .map(|c| {
                let channel: u32 = c.trim().parse().map_err(|_| {
                    SourceError::Adapter(format!("bad channel '{}'", c.trim()))
                })?;
                if channel == 0 || channel > self.channels {
                    return Err(SourceError::Adapter(format!(
                        "channel {} out of range 1..={}",
                        channel, self.channels
                    )));
                }
                Ok(channel)
            })
            .collect()
    }

    fn data(&self, params: &RequestParams, window: &Window) -> Result<DataMatrix, SourceError> {
        let channels = self.channels_of(params)?;
        let columns = channels.len() + 1;
        let range = self.sample_range(window)?;
        let rows = Self::sample_count(&range);

        let mut values = Vec::with_capacity(rows * columns);
        for index in range {
            values.push(index as f64 * self.interval);
            values.extend(channels.iter().map(|&c| self.sample(c, index)));
        }

        let mut names = vec!["t".to_string()];
        names.extend(channels.iter().map(|c| format!("ch{}", c)));
        DataMatrix::from_flat(columns, values)
            .and_then(|m| m.with_column_names(&names))
            .map_err(|e| SourceError::Adapter(e.to_string()))
    }
}

impl DataSource for SyntheticSource {
    fn kind(&self) -> &str {
        KIND
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn count_rows(&self, params: &RequestParams, window: &Window) -> Option<usize> {
        if action(params) != "data" {
            return None;
        }
        // An oversized window counts as unbounded so the row guard rejects it.
        match self.sample_range(window) {
            Ok(range) => Some(Self::sample_count(&range)),
            Err(_) => Some(usize::MAX),
        }
    }

    fn get_data(&self, params: &RequestParams, window: &Window) -> Result<SourceData, SourceError> {
        match action(params) {
            "data" => Ok(SourceData::Matrix(self.data(params, window)?)),
            "channels" => Ok(SourceData::Lines(
                (1..=self.channels)
                    .map(|c| format!("channel={}; name=ch{}; interval={};", c, c, self.interval))
                    .collect(),
            )),
            other => Err(SourceError::UnsupportedAction(other.to_string())),
        }
    }
}
