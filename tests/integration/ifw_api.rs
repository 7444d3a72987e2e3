//! `LocalExecutor::run` dispatching `CommandSpec::IfwApi` against a mocked
//! HTTP checker endpoint.

use guardia_core::actors::command_runner::{CommandExecutor, CommandSpec, LocalExecutor};
use guardia_core::clock::Clock;
use guardia_core::macros::{ArgSpec, MacroResolver, ResolverList};
use guardia_core::registry::ObjectId;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn ifw_api_checker_result_maps_to_a_check_result() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/checker"))
        .and(body_json(serde_json::json!({"address": "10.0.0.5"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "disk": { "exitcode": 1, "checkresult": "WARNING - /var at 85%", "perfdata": ["used=85%;80;95"] }
        })))
        .mount(&server)
        .await;

    let executor = LocalExecutor::new(4);
    let clock = Clock::new();
    let resolvers: ResolverList = vec![("host".to_string(), MacroResolver::Dict(serde_json::json!({"address": "10.0.0.5"})))];
    let arg_spec = vec![ArgSpec { key: "address".to_string(), value: Some("$host.address$".to_string()), set_if: None, repeat_key: false, order: 0 }];
    let spec = CommandSpec::IfwApi { base_url: server.uri(), command_name: "disk".to_string(), arg_spec };

    let result = executor.run(ObjectId(1), &spec, &resolvers, &clock).await.expect("ifw api call should succeed");

    assert_eq!(result.state, 1);
    assert_eq!(result.output, "WARNING - /var at 85%");
    assert_eq!(result.performance_data, vec!["used=85%;80;95".to_string()]);
}

#[tokio::test]
async fn ifw_api_missing_command_field_is_a_command_exec_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/checker"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "other": {} })))
        .mount(&server)
        .await;

    let executor = LocalExecutor::new(4);
    let clock = Clock::new();
    let spec = CommandSpec::IfwApi { base_url: server.uri(), command_name: "disk".to_string(), arg_spec: Vec::new() };

    let err = executor.run(ObjectId(1), &spec, &Vec::new(), &clock).await.unwrap_err();
    assert!(format!("{err}").contains("disk"), "error should name the missing field: {err}");
}
