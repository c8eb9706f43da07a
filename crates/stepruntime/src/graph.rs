use crate::registry::StepRegistry;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use stepcore::{topic_matches, StepTrigger};
use std::collections::HashMap;

/// Directed graph of declared emissions: an edge `a -> b` labelled `t` means
/// step `a` declares it emits `t` and step `b` subscribes to a pattern matching `t`.
pub fn emission_graph(registry: &StepRegistry) -> DiGraph<String, String> {
    let mut graph = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();

    for step in registry.steps() {
        let idx = graph.add_node(step.id.clone());
        index.insert(step.id.as_str(), idx);
    }

    for emitter in registry.steps() {
        let own_tick = match &emitter.trigger {
            StepTrigger::Schedule { event_type, .. } => Some(event_type.as_str()),
            _ => None,
        };

        for emitted in &emitter.emits {
            // the scheduler publishes the tick, not the step's handler
            if Some(emitted.as_str()) == own_tick {
                continue;
            }
            for subscriber in registry.steps() {
                let listens = subscriber
                    .subscribed_patterns()
                    .iter()
                    .any(|p| topic_matches(emitted, p));
                if listens {
                    graph.add_edge(index[emitter.id.as_str()], index[subscriber.id.as_str()], emitted.clone());
                }
            }
        }
    }

    graph
}

/// Groups of steps whose declared emissions can re-trigger each other.
///
/// Each group is sorted; a single step appears only if it feeds itself.
pub fn emission_cycles(registry: &StepRegistry) -> Vec<Vec<String>> {
    let graph = emission_graph(registry);

    let mut cycles: Vec<Vec<String>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|component| component.len() > 1 || graph.contains_edge(component[0], component[0]))
        .map(|component| {
            let mut ids: Vec<String> = component.into_iter().map(|idx| graph[idx].clone()).collect();
            ids.sort();
            ids
        })
        .collect();
    cycles.sort();

    for cycle in &cycles {
        tracing::warn!(steps = ?cycle, "Declared emissions form a cycle; chains may not terminate");
    }

    cycles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::StaticStepSource;

    #[test]
    fn finds_mutual_and_self_cycles_only() {
        let source = StaticStepSource::new()
            .with_unit("ping", "/x", r#"{"subscribes": ["pong"], "emits": ["ping"], "handler": "builtin:log"}"#)
            .with_unit("pong", "/x", r#"{"subscribes": ["ping"], "emits": ["pong"], "handler": "builtin:log"}"#)
            .with_unit("echo", "/x", r#"{"subscribes": ["echo.*"], "emits": ["echo.again"], "handler": "builtin:log"}"#)
            .with_unit("sink", "/x", r#"{"subscribes": ["*"], "handler": "builtin:log"}"#)
            .with_unit("tick", "/x", r#"{"interval": "1m", "emits": ["tick"], "handler": "builtin:log"}"#);
        let (registry, skipped) = StepRegistry::load(&source, &[]);
        assert!(skipped.is_empty());

        let cycles = emission_cycles(&registry);

        assert_eq!(
            cycles,
            vec![
                vec!["echo".to_string()],
                vec!["ping".to_string(), "pong".to_string()],
            ]
        );
    }
}
