//! Backward and forward lineage traces over a DAG snapshot
//!
//! Versions of an element are ordered by commit sequence: a step that
//! consumed `x` read the latest version of `x` committed before it.

use crate::dag::AnalysisDag;
use crate::weighting::ContributionWeighting;
use provenant_types::{ElementId, ProvenanceStep, TracedReference};
use std::collections::BTreeMap;

/// Which way to walk lineage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceDirection {
    /// From an element back to the original inputs
    Backward,
    /// From a source forward to everything derived from it
    Forward,
}

#[derive(Debug, Default)]
struct Tally(BTreeMap<ElementId, (f64, usize)>);

impl Tally {
    fn add(&mut self, element: &ElementId, weight: f64, hops: usize) {
        let entry = self.0.entry(element.clone()).or_insert((0.0, hops));
        entry.0 += weight;
        entry.1 = entry.1.min(hops);
    }

    fn into_traced(self, dag: &AnalysisDag, exclude: Option<&ElementId>) -> Vec<TracedReference> {
        let mut traced: Vec<_> = self
            .0
            .into_iter()
            .filter(|(id, (weight, _))| *weight > 0.0 && Some(id) != exclude)
            .map(|(id, (weight, hops))| TracedReference {
                reference: dag.reference(&id),
                weight,
                hops,
            })
            .collect();
        traced.sort_by(|a, b| {
            a.hops
                .cmp(&b.hops)
                .then_with(|| a.reference.id.cmp(&b.reference.id))
        });
        traced
    }
}

/// Original inputs that `element` derives from, with contribution weights
///
/// A source-ingestion step yields its inputs and stops; any other step
/// recurses into its inputs. An element with no committed writer is itself
/// an original source.
#[must_use]
pub fn trace_to_sources(
    dag: &AnalysisDag,
    element: &ElementId,
    weighting: &dyn ContributionWeighting,
) -> Vec<TracedReference> {
    let mut tally = Tally::default();
    let mut pending = vec![(element.clone(), 1.0_f64, 0_usize, u64::MAX)];

    while let Some((current, weight, hops, before)) = pending.pop() {
        let step = dag
            .provenance(&current)
            .and_then(|p| p.latest_before(before));
        let Some(step) = step else {
            tally.add(&current, weight, hops);
            continue;
        };
        let inputs = &step.transformation.inputs;
        if inputs.is_empty() {
            tally.add(&current, weight, hops);
            continue;
        }

        let share = weight * weighting.hop_weight(step);
        for input in inputs {
            if step.is_source_ingestion() {
                tally.add(&input.id, share, hops + 1);
            } else {
                pending.push((input.id.clone(), share, hops + 1, step.sequence));
            }
        }
    }

    tally.into_traced(dag, None)
}

/// Elements derived from `source`, with contribution weights
///
/// Committed nodes are visited in topological order. An input only carries
/// weight into a step if the step's provenance lists it and an edge leads
/// from the input's producer to the step's node.
#[must_use]
pub fn trace_from_source(
    dag: &AnalysisDag,
    source: &ElementId,
    weighting: &dyn ContributionWeighting,
) -> Vec<TracedReference> {
    let mut tally = Tally::default();
    tally.add(source, 1.0, 0);

    for node_id in dag.topological_order() {
        let Some(node) = dag.node(node_id) else {
            continue;
        };

        let mut updates = Vec::new();
        for output in node.visible_outputs() {
            let Some(step) = dag
                .provenance(&output.id)
                .and_then(|p| p.step_by(node_id))
            else {
                continue;
            };
            let hop = weighting.hop_weight(step);

            let mut sum = 0.0;
            let mut min_hops = None::<usize>;
            for input in &step.transformation.inputs {
                let Some(&(w, h)) = tally.0.get(&input.id) else {
                    continue;
                };
                if w <= 0.0 || !fed_by_edge(dag, &input.id, step) {
                    continue;
                }
                sum += w * hop;
                min_hops = Some(min_hops.map_or(h + 1, |m| m.min(h + 1)));
            }
            updates.push((output.id.clone(), step.consumed(&output.id), sum, min_hops));
        }

        for (element, rewrites, sum, hops) in updates {
            match hops {
                Some(hops) if rewrites => {
                    tally.0.insert(element, (sum, hops));
                }
                Some(hops) => tally.add(&element, sum, hops),
                None if rewrites => {
                    tally.0.remove(&element);
                }
                None => {}
            }
        }
    }

    tally.into_traced(dag, Some(source))
}

/// Whether the version of `input` read by `step` reached it over an edge
fn fed_by_edge(dag: &AnalysisDag, input: &ElementId, step: &ProvenanceStep) -> bool {
    match dag
        .provenance(input)
        .and_then(|p| p.latest_before(step.sequence))
    {
        None => true,
        Some(prev) => prev.node_id == step.node_id || dag.has_edge(prev.node_id, step.node_id),
    }
}
