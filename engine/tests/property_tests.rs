mod common;

use common::{calling, text, Harness};
use proptest::prelude::*;
use sdk::step::StepRequest;
use sdk::types::ToolCall;
use waypoint_engine::config::{Config, SchedulerMode};

proptest! {
    #[test]
    fn test_config_parsing_round_trip(
        log_level in "error|warn|info|debug|trace",
        mode in "http|local|disabled",
        base_delay_ms in 1..=1000u64,
        max_attempts in 1..=10u32,
        tolerance_secs in 1..=3600u64,
    ) {
        let source = format!(
            r#"
[core]
log_level = "{log_level}"
data_dir = "~/.waypoint/data"

[server]
bind_addr = "127.0.0.1:3010"
base_url = "https://agents.example.com"

[signing]
tolerance_secs = {tolerance_secs}

[scheduler]
mode = "{mode}"
publish_url = "https://scheduler.example.com/publish"
base_delay_ms = {base_delay_ms}
max_attempts = {max_attempts}
"#
        );

        let config: Config = toml::from_str(&source).unwrap();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let reparsed: Config = toml::from_str(&serialized).unwrap();

        prop_assert_eq!(&reparsed.core.log_level, &log_level);
        prop_assert_eq!(reparsed.signing.tolerance_secs, tolerance_secs);
        prop_assert_eq!(reparsed.scheduler.base_delay_ms, base_delay_ms);
        prop_assert_eq!(reparsed.scheduler.max_attempts, max_attempts);
        let expected_mode = match mode.as_str() {
            "http" => SchedulerMode::Http,
            "local" => SchedulerMode::Local,
            _ => SchedulerMode::Disabled,
        };
        prop_assert_eq!(reparsed.scheduler.mode, expected_mode);
        prop_assert_eq!(reparsed.run_endpoint(), "https://agents.example.com/agent/run");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Whatever order the scheduler delivers step indexes in, the stored step
    /// count and cost never go backwards and each step body runs at most once
    #[test]
    fn test_step_count_and_cost_are_monotonic(
        deliveries in proptest::collection::vec(0u64..6, 1..20),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let replies = (0..6)
                .map(|i| {
                    if i % 2 == 0 {
                        calling(vec![ToolCall::new(format!("t{}", i), "search", "{}")], 0.01)
                    } else {
                        text("still working", 0.02)
                    }
                })
                .collect();
            let h = Harness::new(replies).await;
            h.create("op-prop").await;

            let mut last_count = 0;
            let mut last_cost = 0.0;
            let mut executed = 0;

            for index in deliveries {
                let result = h.deliver(StepRequest::new("op-prop", index)).await.unwrap();
                let state = &result.state;

                assert!(state.step_count >= last_count);
                assert!(state.cost.total >= last_cost);
                if !result.duplicate {
                    assert_eq!(state.step_count, index + 1);
                    executed += 1;
                }

                last_count = state.step_count;
                last_cost = state.cost.total;
            }

            let stored = h.executor.states().load("op-prop").await.unwrap().unwrap().state;
            assert_eq!(stored.step_count, executed);
        });
    }
}
