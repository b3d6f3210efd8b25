use rand::seq::SliceRandom;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;

use crate::error::Error;
use crate::health::HealthTracker;
use crate::temperature::TemperatureTracker;

/// One cursor per process, shared by every selector instance, so
/// round-robin stays fair across handlers.
static ROUND_ROBIN_CURSOR: AtomicUsize = AtomicUsize::new(0);

/// How a routing gateway is chosen among the selectable candidates.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// Lowest average observed latency; unknown latency sorts last.
    #[default]
    Fastest,
    /// Uniform over the selectable set.
    Random,
    /// Process-global rotating cursor.
    RoundRobin,
    /// Score-weighted draw from the temperature tracker.
    Temperature,
}

impl FromStr for RoutingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fastest" => Ok(RoutingStrategy::Fastest),
            "random" => Ok(RoutingStrategy::Random),
            "round-robin" => Ok(RoutingStrategy::RoundRobin),
            "temperature" => Ok(RoutingStrategy::Temperature),
            _ => Err(Error::Config {
                message: format!(
                    "`{s}` is not a routing strategy (expected `fastest`, `random`, `round-robin`, or `temperature`)"
                ),
            }),
        }
    }
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingStrategy::Fastest => f.write_str("fastest"),
            RoutingStrategy::Random => f.write_str("random"),
            RoutingStrategy::RoundRobin => f.write_str("round-robin"),
            RoutingStrategy::Temperature => f.write_str("temperature"),
        }
    }
}

impl RoutingStrategy {
    /// Pick one gateway, never returning one whose circuit is open.
    pub fn select(
        &self,
        candidates: &[Url],
        health: &HealthTracker,
        temperature: &TemperatureTracker,
    ) -> Result<Url, Error> {
        let selectable: Vec<Url> = candidates
            .iter()
            .filter(|g| health.is_selectable(g))
            .cloned()
            .collect();
        if selectable.is_empty() {
            return Err(Error::NoHealthyGateways {
                message: format!(
                    "none of the {} candidate gateways are selectable",
                    candidates.len()
                ),
            });
        }

        match self {
            RoutingStrategy::Fastest => {
                let mut ranked = selectable;
                // Unknown latency ranks behind any measured latency; ties
                // break on the URL itself so the order is stable.
                ranked.sort_by(|a, b| {
                    let la = temperature.avg_latency(a).unwrap_or(f64::INFINITY);
                    let lb = temperature.avg_latency(b).unwrap_or(f64::INFINITY);
                    la.partial_cmp(&lb)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.as_str().cmp(b.as_str()))
                });
                Ok(ranked.remove(0))
            }
            RoutingStrategy::Random => selectable
                .choose(&mut rand::thread_rng())
                .cloned()
                .ok_or_else(|| Error::NoHealthyGateways {
                    message: "empty selectable set".to_string(),
                }),
            RoutingStrategy::RoundRobin => {
                let index = ROUND_ROBIN_CURSOR.fetch_add(1, Ordering::Relaxed) % selectable.len();
                Ok(selectable[index].clone())
            }
            RoutingStrategy::Temperature => temperature.select_weighted(&selectable),
        }
    }
}
