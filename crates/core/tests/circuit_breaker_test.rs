//! Circuit breaker: ingestion keeps flowing while evolution pauses.

use std::sync::atomic::Ordering;

use aswarm_core::driver::run_cycle;
use aswarm_core::test_utils::{create_test_state, learning_event};
use aswarm_shared::CycleResult;

#[tokio::test]
async fn test_breaker_pauses_evolution_but_not_ingestion() {
    let (state, metrics) = create_test_state().await;
    state.circuit_breaker.store(true, Ordering::Relaxed);

    // Inject a sustained burst of events while the breaker is engaged.
    for i in 0..300 {
        state
            .bus
            .emit(learning_event(i, "T1021.lateral-movement", 0.7))
            .unwrap();
    }

    for tick in 1u64..=5 {
        assert_eq!(run_cycle(&state).await, CycleResult::CircuitBreaker);
        assert_eq!(
            metrics.counter("evolution_cycles_total", &[("result", "circuit_breaker")]),
            tick
        );
    }

    // The queue accepted everything and no evolution work started.
    assert_eq!(metrics.counter_total("events_dropped_total"), 0);
    assert_eq!(state.bus.queue_len(), 300);
    assert_eq!(state.population.total_antibodies().await, 0);
    assert_eq!(state.population.generation().await, 0);
}

#[tokio::test]
async fn test_releasing_breaker_resumes_evolution() {
    let (state, metrics) = create_test_state().await;
    state.circuit_breaker.store(true, Ordering::Relaxed);
    for i in 0..60 {
        state
            .bus
            .emit(learning_event(i, "T1496.cryptomining", 0.8))
            .unwrap();
    }
    assert_eq!(run_cycle(&state).await, CycleResult::CircuitBreaker);

    state.circuit_breaker.store(false, Ordering::Relaxed);
    assert_eq!(run_cycle(&state).await, CycleResult::Success);
    assert_eq!(state.population.generation().await, 1);
    assert_eq!(
        metrics.counter("evolution_cycles_total", &[("result", "success")]),
        1
    );
}
