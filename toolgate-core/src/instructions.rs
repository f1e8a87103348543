//! Custom-instruction policy check.
//!
//! When an agent carries a custom instruction for a function, the policy is
//! consulted before the request is composed. The gateway ships an allow-all
//! default; deployments plug in an LLM- or rule-backed implementation.

use async_trait::async_trait;
use serde_json::Value;

/// Outcome of an instruction policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionDecision {
    Allow,
    Deny { reason: String },
}

/// Pluggable guard consulted before executing a function the agent has
/// custom instructions for.
#[async_trait]
pub trait InstructionPolicy: Send + Sync {
    async fn check(
        &self,
        function_name: &str,
        instruction: &str,
        function_input: &Value,
    ) -> InstructionDecision;
}

/// Default policy: record nothing, block nothing.
#[derive(Debug, Default)]
pub struct AllowAllPolicy;

#[async_trait]
impl InstructionPolicy for AllowAllPolicy {
    async fn check(
        &self,
        _function_name: &str,
        _instruction: &str,
        _function_input: &Value,
    ) -> InstructionDecision {
        InstructionDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_allow_all_policy() {
        let policy = AllowAllPolicy;
        let decision = policy
            .check(
                "GMAIL__SEND_EMAIL",
                "only send to example.com addresses",
                &json!({"body": {"to": "a@other.com"}}),
            )
            .await;
        assert_eq!(decision, InstructionDecision::Allow);
    }

    struct DenyRecipients;

    #[async_trait]
    impl InstructionPolicy for DenyRecipients {
        async fn check(
            &self,
            _function_name: &str,
            instruction: &str,
            function_input: &Value,
        ) -> InstructionDecision {
            let to = function_input["body"]["to"].as_str().unwrap_or_default();
            if instruction.contains("example.com") && !to.ends_with("@example.com") {
                return InstructionDecision::Deny {
                    reason: format!("recipient {to} violates instruction"),
                };
            }
            InstructionDecision::Allow
        }
    }

    #[tokio::test]
    async fn test_custom_policy_can_deny() {
        let policy = DenyRecipients;
        let decision = policy
            .check(
                "GMAIL__SEND_EMAIL",
                "only send to example.com addresses",
                &json!({"body": {"to": "a@other.com"}}),
            )
            .await;
        assert!(matches!(decision, InstructionDecision::Deny { .. }));
    }
}
