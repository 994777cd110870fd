//! Textual report rendering.

use console::style;
use stackmax_graph::EntrypointResult;

use crate::pipeline::Analysis;

/// Print the per-function table, the entrypoint summary, and the global
/// maximum.
pub fn print_summary(analysis: &Analysis, call_chains: bool) {
    print_functions(analysis);
    println!();
    print_entrypoints(analysis);

    if call_chains {
        println!();
        print_chains(analysis);
    }
}

fn print_functions(analysis: &Analysis) {
    println!("{}", style("Functions").bold());
    println!(
        "  {:<10} {:>11} {:>16} {:>7} {:>6}  {}",
        style("Address").dim(),
        style("Local (B)").dim(),
        style("Cumulative (B)").dim(),
        style("Calls").dim(),
        style("State").dim(),
        style("Name").dim(),
    );

    for node in analysis.graph.nodes.values() {
        let cumulative = analysis
            .function_totals
            .get(&node.address)
            .copied()
            .flatten();
        let (local, state) = if node.faults.is_empty() {
            (node.prologue_cost().to_string(), style("ok").green())
        } else {
            ("-".to_string(), style("fault").red())
        };
        println!(
            "  {:<10} {:>11} {:>16} {:>7} {:>6}  {}",
            format!("{:#06x}", node.address),
            local,
            cumulative.map_or_else(|| "-".to_string(), |depth| depth.to_string()),
            node.edges.len(),
            state,
            node.display_name(),
        );
    }
}

fn print_entrypoints(analysis: &Analysis) {
    println!("{}", style("Entrypoints").bold());
    println!(
        "  {:<16} {:>9} {:>11} {:>15} {:>11}  {}",
        style("Entrypoint").dim(),
        style("Priority").dim(),
        style("Local (B)").dim(),
        style("Preemption (B)").dim(),
        style("Total (B)").dim(),
        style("Status").dim(),
    );

    for result in &analysis.results {
        let entrypoint = &result.entrypoint;
        match &result.outcome {
            Ok(report) => {
                println!(
                    "  {:<16} {:>9} {:>11} {:>15} {:>11}  {}",
                    entrypoint.name,
                    entrypoint.priority.to_string(),
                    report.local_depth,
                    report.preemption,
                    style(report.total).bold(),
                    style("ok").green(),
                );
            }
            Err(failure) => {
                println!(
                    "  {:<16} {:>9} {:>11} {:>15} {:>11}  {}",
                    entrypoint.name,
                    entrypoint.priority.to_string(),
                    "-",
                    "-",
                    "-",
                    style(failure.kind).red(),
                );
                println!("    {}", style(&failure.detail).red().dim());
            }
        }
    }

    println!();
    match analysis.global_max() {
        Some(max) if !analysis.has_failures() => {
            println!(
                "{} {}",
                style("Worst-case stack depth:").bold(),
                style(format!("{max} B")).bold().cyan(),
            );
        }
        Some(max) => {
            println!(
                "{} {} {}",
                style("Worst-case stack depth:").bold(),
                style(format!(">= {max} B")).bold().yellow(),
                style("(some entrypoints have no verdict)").yellow(),
            );
        }
        None => {
            println!("{}", style("No entrypoint has a verdict.").red());
        }
    }
}

fn print_chains(analysis: &Analysis) {
    println!("{}", style("Call chains").bold());

    for result in &analysis.results {
        print_chain(result);
    }
}

fn print_chain(result: &EntrypointResult) {
    let entrypoint = &result.entrypoint;
    match &result.outcome {
        Ok(report) => {
            println!(
                "  {} ({} B total)",
                style(&entrypoint.name).cyan(),
                report.total
            );
            for step in &report.chain {
                println!(
                    "    {:<10} {:>6} B  {}",
                    format!("{:#06x}", step.address),
                    step.contribution,
                    step.name,
                );
            }
            for charge in &report.preempters {
                println!(
                    "    {} {} (priority {}): +{} B",
                    style("preempted by").yellow(),
                    charge.name,
                    charge.priority,
                    charge.bytes,
                );
            }
        }
        Err(failure) => {
            println!(
                "  {} {}",
                style(&entrypoint.name).cyan(),
                style(failure.kind).red()
            );
            for step in &failure.chain {
                println!(
                    "    {:<10} {:>6} B  {}",
                    format!("{:#06x}", step.address),
                    step.contribution,
                    step.name,
                );
            }
            println!("    {}", style(&failure.detail).red().dim());
        }
    }
}
