//! We read the processor topology and write the efficiency processors it reports to the
//! terminal, together with the processor a binding pass would target.
//!
//! Nothing on the machine is modified.

use ecore_pin::{BindingCycle, TopologyProbe};

fn main() {
    let probe = TopologyProbe::new();
    let total = probe.logical_processor_count();

    println!("logical processors: {total}");

    match probe.discover_efficient_cores() {
        Ok(cores) => println!("efficiency processors: {cores}"),
        Err(e) => println!("efficiency processors: none ({e})"),
    }

    let target = BindingCycle::new().resolve_target_core(total);
    println!(
        "target processor: {} ({})",
        target.core(),
        target.strategy()
    );
}
