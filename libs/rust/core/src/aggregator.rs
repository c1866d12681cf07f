//! Federated averaging.
//!
//! Every tensor index is averaged elementwise, weighted by each result's sample count.
//! Accumulation is always `f64`; the output keeps the storage precision of the inputs.
//! Results are folded in ascending client-id order, so the output does not depend on
//! arrival order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{FlError, Result};
use crate::parameters::{ParameterSet, Tensor, TensorData};
use crate::protocol::{ClientId, EvaluateResult, FitResult, Metrics};

/// Metrics combined across clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    /// Weighted means of keys every result reported.
    pub combined: Metrics,
    /// Keys only some results reported, left per client.
    pub per_client: BTreeMap<String, BTreeMap<ClientId, f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateAggregate {
    pub loss: f64,
    pub num_examples: u64,
    pub metrics: AggregatedMetrics,
}

pub fn aggregate_fit(results: &[FitResult]) -> Result<ParameterSet> {
    let mut ordered: Vec<&FitResult> = results.iter().collect();
    ordered.sort_by(|a, b| a.client_id.cmp(&b.client_id));
    let Some(first) = ordered.first() else {
        return Err(FlError::NoResultsToAggregate);
    };
    let reference = &first.parameters;
    for r in &ordered[1..] {
        reference.ensure_same_layout(&r.parameters)?;
    }
    if ordered.len() == 1 {
        return Ok(reference.clone());
    }

    let total: f64 = ordered.iter().map(|r| r.num_examples as f64).sum();
    let tensors = reference
        .iter()
        .enumerate()
        .map(|(index, base)| {
            let mut acc = vec![0f64; base.len()];
            for r in &ordered {
                let weight = r.num_examples as f64;
                let data = r.parameters.tensors()[index].data();
                for (j, slot) in acc.iter_mut().enumerate() {
                    *slot += weight * data.get_f64(j);
                }
            }
            for slot in acc.iter_mut() {
                *slot /= total;
            }
            Tensor::new(base.name(), base.shape().to_vec(), TensorData::from_f64(base.dtype(), acc))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ParameterSet::new(tensors))
}

pub fn aggregate_evaluate(results: &[EvaluateResult]) -> Result<EvaluateAggregate> {
    if results.is_empty() {
        return Err(FlError::NoResultsToAggregate);
    }
    let mut ordered: Vec<&EvaluateResult> = results.iter().collect();
    ordered.sort_by(|a, b| a.client_id.cmp(&b.client_id));
    let num_examples = ordered.iter().fold(0u64, |acc, r| acc.saturating_add(r.num_examples));
    let total: f64 = ordered.iter().map(|r| r.num_examples as f64).sum();
    let loss = ordered.iter().map(|r| r.num_examples as f64 * r.loss).sum::<f64>() / total;
    let metrics = aggregate_metrics(ordered.iter().map(|r| (&r.client_id, r.num_examples, &r.metrics)));
    Ok(EvaluateAggregate { loss, num_examples, metrics })
}

pub fn aggregate_fit_metrics(results: &[FitResult]) -> AggregatedMetrics {
    let mut ordered: Vec<&FitResult> = results.iter().collect();
    ordered.sort_by(|a, b| a.client_id.cmp(&b.client_id));
    aggregate_metrics(ordered.iter().map(|r| (&r.client_id, r.num_examples, &r.metrics)))
}

/// Weighted mean for keys present in every entry; the rest are kept per client.
pub fn aggregate_metrics<'a, I>(entries: I) -> AggregatedMetrics
where
    I: IntoIterator<Item = (&'a ClientId, u64, &'a Metrics)>,
{
    let entries: Vec<_> = entries.into_iter().collect();
    let mut out = AggregatedMetrics::default();
    if entries.is_empty() {
        return out;
    }
    let mut keys: BTreeMap<&str, usize> = BTreeMap::new();
    for (_, _, m) in &entries {
        for k in m.keys() {
            *keys.entry(k.as_str()).or_default() += 1;
        }
    }
    let total: f64 = entries.iter().map(|(_, n, _)| *n as f64).sum();
    for (key, count) in keys {
        if count == entries.len() {
            let sum: f64 = entries.iter().map(|(_, n, m)| *n as f64 * m[key]).sum();
            out.combined.insert(key.to_string(), sum / total);
        } else {
            let per = entries
                .iter()
                .filter_map(|(id, _, m)| m.get(key).map(|v| ((*id).clone(), *v)))
                .collect();
            out.per_client.insert(key.to_string(), per);
        }
    }
    out
}
