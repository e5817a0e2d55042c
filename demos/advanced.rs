//! Advanced Guard Rail Example
//!
//! This example demonstrates:
//! 1. Layering a circuit breaker in front of a semaphore gate
//! 2. Using hooks for monitoring breaker state transitions
//! 3. Reading rolling counters and latency percentiles
//! 4. Recovery through the half-open probe

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use guardrail_rs::{
    ActionError, CircuitBreaker, GuardRail, HookRegistry, LatencyRecorder, OutcomeMap,
    RejectionClass, ResultClass, RollingCounts, SemaphoreGate, ThreadPoolExecutor,
};

// A function that simulates an external service with varying failure patterns
fn external_service_call(attempt: u32) -> Result<String, ActionError> {
    if attempt <= 3 {
        // First 3 calls succeed
        Ok("Initial success".to_string())
    } else if attempt <= 8 {
        // Next 5 calls fail (should trip the breaker)
        Err("Service temporarily unavailable".into())
    } else {
        // After that, all calls succeed
        Ok("Stable success".to_string())
    }
}

fn main() {
    println!("=== Advanced Guard Rail Example ===\n");

    let results = ResultClass::builder()
        .success("success")
        .failure("error")
        .failure("timeout")
        .build();
    let rejections = RejectionClass::builder()
        .reason("max-concurrency")
        .reason("circuit-open")
        .build();

    // 1. Set up a hook registry for observability
    let hooks = HookRegistry::new();
    hooks.set_on_open(|| println!("[hook] Circuit OPENED due to too many failures"));
    hooks.set_on_close(|| println!("[hook] Circuit CLOSED after successful recovery"));
    hooks.set_on_half_open(|| println!("[hook] Circuit HALF-OPEN, testing recovery"));

    // 2. Share one counter between the rail and the breaker that samples it
    let counts = Arc::new(RollingCounts::new(&results, Duration::from_secs(10), 10));
    let latency = Arc::new(LatencyRecorder::new(&results, 10_000_000_000, 2));
    let breaker = Arc::new(
        CircuitBreaker::builder(
            Arc::clone(&counts),
            rejections.reason("circuit-open").unwrap(),
        )
        .trailing_period(Duration::from_secs(5))
        .failure_threshold(3) // trip on the 4th failure in the window
        .backoff_time(Duration::from_secs(2))
        .hooks(hooks)
        .build(),
    );
    let gate = Arc::new(SemaphoreGate::new(
        5,
        rejections.reason("max-concurrency").unwrap(),
    ));

    let rail = GuardRail::builder("inventory", results.clone(), rejections)
        .result_counts(Arc::clone(&counts))
        .latency(Arc::clone(&latency))
        .add_back_pressure("breaker", Arc::clone(&breaker))
        .add_back_pressure("semaphore", gate)
        .build();

    let executor = ThreadPoolExecutor::new("inventory", 2);
    let outcomes = OutcomeMap::fixed(
        results.outcome("success").unwrap(),
        results.outcome("error").unwrap(),
        results.outcome("timeout").unwrap(),
    );

    // 3. Simulate a series of calls to demonstrate breaker behavior
    for attempt in 1..=15u32 {
        println!("\n--- Call {} ---", attempt);

        let future = executor.submit(
            &rail,
            move || external_service_call(attempt),
            outcomes.clone(),
            Some(Duration::from_secs(1)),
        );

        if future.is_rejected() {
            println!("Rejected before running: {}", future.reject_reason().unwrap());
        } else {
            match future.wait() {
                Ok(completion) => match completion.value() {
                    Some(value) => println!("Service response: {}", value),
                    None => println!(
                        "Completed as '{}': {}",
                        completion.outcome(),
                        completion.error().map(|e| e.to_string()).unwrap_or_default()
                    ),
                },
                Err(err) => println!("Unexpected error: {}", err),
            }
        }

        println!(
            "Circuit metrics: state={:?}, window failures={}",
            breaker.current_state(),
            breaker.health(rail.now_nanos()).failures
        );

        // Add a delay between calls for readability
        thread::sleep(Duration::from_millis(300));
    }

    // 4. Dump the accumulated metrics
    let success = results.outcome("success").unwrap();
    println!(
        "\nsuccess p99 latency: {:?}ns, max: {:?}ns",
        latency.percentile(&success, 99.0),
        latency.max(&success)
    );

    executor.shutdown();
    println!("\n=== Example Completed ===");
}
