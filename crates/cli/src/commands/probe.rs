use uuid::Uuid;

use crate::commands::ask::{http_client, post_turn};
use crate::commands::{block_on, CommandResult};

/// Protocol checks from the system prompt: exact-arithmetic handling and
/// table output for comparisons.
pub const PROBES: [(&str, &str); 2] = [
    (
        "calculation_safety",
        "Calculate the specific embedded emissions for 500 tons of steel with 1200 tons of CO2e total emissions.",
    ),
    (
        "table_comparison",
        "Compare the reporting requirements for the transitional phase vs the definitive phase.",
    ),
];

#[derive(Debug)]
pub struct ProbeOutcome {
    pub name: &'static str,
    pub question: &'static str,
    pub session_id: String,
    pub answer: Result<String, String>,
}

pub async fn run_probes(client: &reqwest::Client, url: &str) -> Vec<ProbeOutcome> {
    let mut outcomes = Vec::with_capacity(PROBES.len());
    for (name, question) in PROBES {
        let session_id = format!("probe-{name}-{}", Uuid::new_v4());
        let answer = post_turn(client, url, question, &session_id)
            .await
            .map(|answer| answer.output)
            .map_err(|error| error.to_string());
        outcomes.push(ProbeOutcome { name, question, session_id, answer });
    }
    outcomes
}

pub fn render(url: &str, outcomes: &[ProbeOutcome]) -> String {
    let rule = "=".repeat(80);
    let mut lines = vec![format!("probing {url}"), rule.clone()];

    for outcome in outcomes {
        lines.push(format!("--- {} ({}) ---", outcome.name, outcome.session_id));
        lines.push(format!("Q: {}", outcome.question));
        match &outcome.answer {
            Ok(answer) => lines.push(format!("A:\n{answer}")),
            Err(error) => lines.push(format!("Error: {error}")),
        }
        lines.push(rule.clone());
    }

    lines.join("\n")
}

pub fn run(url: &str) -> CommandResult {
    let outcomes = match block_on("probe", async {
        let client = http_client()?;
        Ok::<_, reqwest::Error>(run_probes(&client, url).await)
    }) {
        Ok(outcomes) => outcomes,
        Err(failure) => return failure,
    };

    match outcomes {
        Ok(outcomes) => {
            let failed = outcomes.iter().any(|outcome| outcome.answer.is_err());
            CommandResult { exit_code: if failed { 1 } else { 0 }, output: render(url, &outcomes) }
        }
        Err(error) => CommandResult::failure("probe", "http_client", error.to_string(), 3),
    }
}
