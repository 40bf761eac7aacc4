//! `authflow servers`

use prettytable::{row, Table};

use crate::config::Config;

/// Lists the configured servers.
pub fn run_servers(config: &Config) {
    if config.servers.is_empty() {
        println!("No servers configured.");
        return;
    }

    let mut table = Table::new();
    table.add_row(row!["Id", "URL", "Version", "Registration", "Scope"]);
    for server in &config.servers {
        table.add_row(row![
            server.id,
            server.url,
            server.protocol_version,
            server.registration.kind(),
            server.scope.as_deref().unwrap_or("-")
        ]);
    }
    println!("\nConfigured servers:\n");
    table.printstd();
    println!();
}
