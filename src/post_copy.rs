//! Post-copy: pause the source, switch the VM over at once and pull its
//! memory across afterwards.
//!
//! Zero pages never travel since the reservation starts zeroed. A guest
//! write to a page that has not arrived yet is a demand fault: the page is
//! resident from then on and the background push skips it.

use crate::{
    Result, log_info,
    migration::{
        MigrationPhase, MigrationSession, MigrationStrategy, StopReason, StrategyKind,
        StrategyOutcome,
    },
    vm::VmState,
};
use async_trait::async_trait;

pub struct PostCopy;

#[async_trait]
impl MigrationStrategy for PostCopy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PostCopy
    }

    async fn run(&self, session: &mut MigrationSession) -> Result<StrategyOutcome> {
        let source = session.source_vm.clone();
        let destination = session.destination_vm.clone();
        let total_pages = source.total_pages();

        session.enter(MigrationPhase::StopAndCopy);
        source.set_state(VmState::Paused);
        source.memory().freeze_and_snapshot();

        let pending = source.memory().non_zero_pages();
        let zero_pages_skipped = total_pages - pending.count();
        log_info!(
            "MIGRATION {}: {} pages to pull, {} zero pages skipped",
            session.id,
            pending.count(),
            zero_pages_skipped
        );
        if !pending.is_empty() {
            destination.memory().begin_pending(pending);
        }

        session.enter(MigrationPhase::Activating);
        destination.set_dirty_rate(source.dirty_rate_pps());
        session.destination_host.activate(destination.id())?;

        let batch_pages = session.config.post_copy_batch_pages.max(1);
        loop {
            let batch = destination.memory().next_pending_batch(batch_pages);
            if batch.is_empty() {
                break;
            }
            session.enter(MigrationPhase::PostCopy {
                remaining_pages: destination.memory().pending_count(),
            });

            let seconds = session.pay_transfer(batch.len()).await;
            let values = source.memory().read_pages(&batch);
            let installed = destination.memory().install_pending(&values);
            session.iterations += 1;
            session.pages_sent += batch.len() as u64;
            log_info!(
                "MIGRATION {}: batch {}: {} pages pushed ({} installed) in {:.3} s",
                session.id,
                session.iterations,
                batch.len(),
                installed,
                seconds
            );
        }

        // Faulted pages were rewritten on the destination and never sent.
        let demand_faults = destination.memory().demand_faults();

        session.source_host.evict(source.id()).await?;

        Ok(StrategyOutcome {
            stop_reason: StopReason::NotApplicable,
            final_copy_pages: 0,
            demand_faults,
            zero_pages_skipped,
        })
    }
}
