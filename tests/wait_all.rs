//! The all-children sweep reaps every child of the test process, so these
//! tests live in their own binary where no other child is in flight.

use anyhow::Result;
use hatch::{Attributes, WaitAll, launch, wait_all};

#[test]
fn sweep_finds_and_outlives_children() -> Result<()> {
    let mut attrs = Attributes::new();
    let children: Vec<_> = (0..3)
        .map(|_| launch("/bin/sleep", &["1"], None, &mut attrs))
        .collect::<hatch::Result<_>>()?;

    // The children are still asleep; the non-blocking sweep sees them.
    assert!(matches!(wait_all(false)?, WaitAll::SomeRunning));

    // The blocking sweep takes them all the way down.
    assert!(matches!(wait_all(true)?, WaitAll::AllDone));
    assert!(matches!(wait_all(false)?, WaitAll::AllDone));

    // Reaped by the sweep; the records are just records now.
    drop(children);
    Ok(())
}
