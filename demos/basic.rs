use std::sync::Arc;
use std::time::Duration;

use guardrail_rs::{
    ActionError, GuardRail, OutcomeMap, RejectionClass, ResultClass, SemaphoreGate,
    ThreadPoolExecutor,
};

// A service call that fails on even attempts to exercise the rail.
fn call_service(attempt: u32) -> Result<String, ActionError> {
    if attempt % 2 == 0 {
        Err("External service error".into())
    } else {
        Ok("Success".to_string())
    }
}

fn main() {
    // The closed set of outcomes this rail accounts for.
    let results = ResultClass::builder()
        .success("success")
        .failure("error")
        .failure("timeout")
        .build();
    let rejections = RejectionClass::builder().reason("max-concurrency").build();

    let gate = Arc::new(SemaphoreGate::new(
        3, // at most 3 concurrent calls
        rejections.reason("max-concurrency").unwrap(),
    ));
    let rail = GuardRail::builder("payments", results.clone(), rejections)
        .add_back_pressure("semaphore", Arc::clone(&gate))
        .build();

    let executor = ThreadPoolExecutor::new("payments", 2);
    let outcomes = OutcomeMap::fixed(
        results.outcome("success").unwrap(),
        results.outcome("error").unwrap(),
        results.outcome("timeout").unwrap(),
    );

    // Make 10 guarded calls.
    for attempt in 1..=10u32 {
        println!("\nAttempt {}: ", attempt);

        let future = executor.submit(
            &rail,
            move || call_service(attempt),
            outcomes.clone(),
            Some(Duration::from_millis(200)),
        );

        if future.is_rejected() {
            println!("Rejected: {}", future.reject_reason().unwrap());
            continue;
        }

        match future.wait() {
            Ok(completion) => match completion.value() {
                Some(value) => println!("Call succeeded with result: {}", value),
                None => println!(
                    "Call finished as '{}': {}",
                    completion.outcome(),
                    completion.error().map(|e| e.to_string()).unwrap_or_default()
                ),
            },
            Err(err) => println!("Other error: {}", err),
        }

        println!("Permits in use: {}/{}", gate.in_use(), gate.max());
    }

    executor.shutdown();
}
