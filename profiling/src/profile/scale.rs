// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2023-Present Datadog, Inc.

use super::{LocationId, Profile, Sample};
use crate::collections::identifiable::FxIndexMap;
use std::collections::BTreeMap;

fn scale_value(value: i64, ratio: f64) -> anyhow::Result<i64> {
    let scaled = (value as f64 * ratio).round();
    // i64::MAX as f64 rounds up to 2^63, which itself doesn't fit.
    if !scaled.is_finite() || scaled >= i64::MAX as f64 || scaled < i64::MIN as f64 {
        anyhow::bail!("scaling {value} by {ratio} overflows an i64");
    }
    Ok(scaled as i64)
}

impl Profile {
    /// Multiplies every sample value by `ratio`.
    pub fn scale(&mut self, ratio: f64) -> anyhow::Result<()> {
        if ratio == 1.0 {
            return Ok(());
        }
        let ratios = vec![ratio; self.sample_types.len()];
        self.scale_n(&ratios)
    }

    /// Multiplies each column of sample values by its own ratio, rounding to
    /// the nearest integer. Samples whose values all become zero are
    /// removed. Nothing is modified if any value would overflow.
    pub fn scale_n(&mut self, ratios: &[f64]) -> anyhow::Result<()> {
        if ratios.len() != self.sample_types.len() {
            anyhow::bail!(
                "mismatched scale ratios, got {}, want {}",
                ratios.len(),
                self.sample_types.len()
            );
        }
        if ratios.iter().all(|r| *r == 1.0) {
            return Ok(());
        }

        let mut scaled = Vec::with_capacity(self.samples.len());
        for sample in self.samples.iter() {
            let values = sample
                .values
                .iter()
                .zip(ratios.iter())
                .map(|(value, ratio)| scale_value(*value, *ratio))
                .collect::<anyhow::Result<Vec<_>>>()?;
            scaled.push(values);
        }

        let before = self.samples.len();
        let mut scaled = scaled.into_iter();
        self.samples.retain_mut(|sample| match scaled.next() {
            Some(values) => {
                sample.values = values;
                sample.values.iter().any(|v| *v != 0)
            }
            None => true,
        });
        if before != self.samples.len() {
            log::debug!(
                "scaling removed {} samples whose values became zero",
                before - self.samples.len()
            );
        }
        Ok(())
    }

    /// Aggregates samples that have the same stack and the same labels by
    /// summing their values, and drops samples whose values are all zero.
    /// Fails without modifying the profile if any sum overflows.
    pub fn compact(&mut self) -> anyhow::Result<()> {
        type SampleKey<'a> = (
            &'a [LocationId],
            &'a BTreeMap<String, Vec<String>>,
            &'a BTreeMap<String, Vec<i64>>,
            &'a BTreeMap<String, Vec<String>>,
        );

        let mut aggregated: FxIndexMap<SampleKey<'_>, Vec<i64>> = FxIndexMap::default();
        for sample in self.samples.iter() {
            let key = (
                sample.locations.as_slice(),
                &sample.labels,
                &sample.num_labels,
                &sample.num_units,
            );
            match aggregated.get_mut(&key) {
                None => {
                    aggregated.insert(key, sample.values.clone());
                }
                Some(values) => {
                    for (total, value) in values.iter_mut().zip(sample.values.iter()) {
                        *total = match total.checked_add(*value) {
                            Some(sum) => sum,
                            None => anyhow::bail!("aggregating sample values overflows an i64"),
                        };
                    }
                }
            }
        }

        let samples: Vec<Sample> = aggregated
            .into_iter()
            .filter(|(_, values)| values.iter().any(|v| *v != 0))
            .map(|((locations, labels, num_labels, num_units), values)| Sample {
                locations: locations.to_vec(),
                values,
                labels: labels.clone(),
                num_labels: num_labels.clone(),
                num_units: num_units.clone(),
            })
            .collect();
        log::debug!(
            "compacted {} samples into {}",
            self.samples.len(),
            samples.len()
        );
        self.samples = samples;
        Ok(())
    }
}
