/*!
Command handlers for the CLI

One module per subcommand. Handlers build an
[`AuthManager`](crate::auth::manager::AuthManager) from the loaded
configuration, run the operation, and print the result. Rendering helpers
shared by several commands live here.
*/

use colored::Colorize;
use prettytable::{row, Table};

use crate::flow::state::{FlowState, FlowStep};

pub mod callback;
pub mod connect;
pub mod reset;
pub mod servers;
pub mod status;
pub mod token;

/// Colored label for a step.
pub(crate) fn step_label(state: &FlowState) -> String {
    match state.step {
        FlowStep::Authorized => state.step.to_string().green().bold().to_string(),
        FlowStep::Error if state.is_terminal() => state.step.to_string().red().bold().to_string(),
        FlowStep::Error => state.step.to_string().yellow().bold().to_string(),
        FlowStep::RedirectToAuthorize => state.step.to_string().cyan().to_string(),
        _ => state.step.to_string(),
    }
}

/// Prints where the flow stopped and what to do next.
pub(crate) fn print_outcome(state: &FlowState) {
    println!("\nServer:  {}", state.server_id);
    println!("Version: {}", state.protocol_version);
    println!("Step:    {}", step_label(state));

    if let Some(issuer) = &state.authorization_server {
        println!("Issuer:  {issuer}");
    }
    if let Some(failure) = &state.last_error {
        println!("\n{} {}", "Error:".red().bold(), failure.error);
        println!("  failed at {} (resume from {})", failure.failed_at, failure.resume_from);
        println!("  {}", failure.error.guidance());
    }
    if let Some(tokens) = state.token_set.as_ref().filter(|_| state.step == FlowStep::Authorized) {
        let expiry = tokens
            .expires_at()
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!("\nAccess token stored (expires {expiry}).");
    }
    println!();
}

/// Prints the exchange log; `detailed` adds redacted headers and bodies.
pub(crate) fn print_exchanges(state: &FlowState, detailed: bool) {
    if state.exchanges.is_empty() {
        println!("No HTTP exchanges recorded.");
        return;
    }

    let mut table = Table::new();
    table.add_row(row!["#", "Step", "Method", "URL", "Status", "ms"]);
    for (idx, exchange) in state.exchanges.iter().enumerate() {
        let status = match (exchange.status(), &exchange.transport_error) {
            (Some(code), _) => code.to_string(),
            (None, Some(e)) => format!("failed: {e}"),
            (None, None) => "-".to_string(),
        };
        table.add_row(row![
            idx + 1,
            exchange.step,
            exchange.request.method,
            exchange.request.url,
            status,
            exchange.elapsed_ms
        ]);
    }
    table.printstd();

    if !detailed {
        return;
    }
    for (idx, exchange) in state.exchanges.iter().enumerate() {
        let shown = exchange.redacted();
        println!("\n{} {} {}", format!("[{}]", idx + 1).bold(), shown.request.method, shown.request.url);
        for (name, value) in &shown.request.headers {
            println!("  > {name}: {value}");
        }
        if let Some(body) = &shown.request.body {
            println!("  > {body}");
        }
        if let Some(response) = &shown.response {
            println!("  < {}", response.status);
            for (name, value) in &response.headers {
                println!("  < {name}: {value}");
            }
            if !response.body.is_empty() {
                println!("  < {}", response.body);
            }
        }
    }
    println!();
}
