//! Iterative pre-copy: push all memory while the guest keeps running, re-send
//! whatever it dirtied in the meantime, then pause it for a short final copy.

use crate::{
    Result, log_info,
    memory::DirtySet,
    migration::{
        MigrationConfig, MigrationPhase, MigrationSession, MigrationStrategy, StopReason,
        StrategyKind, StrategyOutcome,
    },
    vm::VmState,
};
use async_trait::async_trait;

pub struct PreCopy;

/// Limits checked before every iterative round. The dirty-page threshold is
/// checked separately once the round's snapshot is known.
pub fn round_limit(
    config: &MigrationConfig,
    iterations: u32,
    pages_sent: u64,
    total_pages: usize,
) -> Option<StopReason> {
    if iterations >= config.max_iterations {
        return Some(StopReason::IterationLimit);
    }
    if pages_sent as f64 > config.max_data_sent_factor * total_pages as f64 {
        return Some(StopReason::DataLimit);
    }
    None
}

impl PreCopy {
    async fn send_round(session: &mut MigrationSession, pages: &DirtySet) -> usize {
        let count = pages.count();
        let seconds = session.pay_transfer(count).await;
        let copied = session
            .source_vm
            .memory()
            .copy_pages_to(session.destination_vm.memory(), pages);
        session.pages_sent += copied as u64;
        log_info!(
            "MIGRATION {}: iteration {}: {} pages transferred in {:.3} s",
            session.id,
            session.iterations,
            count,
            seconds
        );
        copied
    }
}

#[async_trait]
impl MigrationStrategy for PreCopy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PreCopy
    }

    async fn run(&self, session: &mut MigrationSession) -> Result<StrategyOutcome> {
        let total_pages = session.source_vm.total_pages();

        // Round 0 sends everything, plus anything dirtied before we started.
        session.enter(MigrationPhase::PreCopy { iteration: 0 });
        let mut initial = DirtySet::full(total_pages);
        initial.union_with(&session.source_vm.memory().snapshot_and_clear());
        Self::send_round(session, &initial).await;

        let mut deferred = DirtySet::empty(total_pages);
        let stop_reason = loop {
            if let Some(reason) = round_limit(
                &session.config,
                session.iterations,
                session.pages_sent,
                total_pages,
            ) {
                break reason;
            }

            let dirty = session.source_vm.memory().snapshot_and_clear();
            if dirty.count() < session.config.min_dirty_pages {
                deferred = dirty;
                break StopReason::Converged;
            }

            session.iterations += 1;
            session.enter(MigrationPhase::PreCopy {
                iteration: session.iterations,
            });
            Self::send_round(session, &dirty).await;
        };
        log_info!(
            "MIGRATION {}: stop condition met after {} rounds: {:?}",
            session.id,
            session.iterations,
            stop_reason
        );

        session.enter(MigrationPhase::StopAndCopy);
        session.source_vm.set_state(VmState::Paused);
        let mut last = session.source_vm.memory().freeze_and_snapshot();
        last.union_with(&deferred);
        let final_copy_pages = last.count();
        let downtime = session.pay_transfer(final_copy_pages).await;
        session
            .source_vm
            .memory()
            .copy_pages_to(session.destination_vm.memory(), &last);
        session.pages_sent += final_copy_pages as u64;
        log_info!(
            "MIGRATION {}: final copy of {} pages, downtime {:.3} s",
            session.id,
            final_copy_pages,
            downtime
        );

        // The destination holds the complete image now; bring it up before
        // tearing down the source so a failed stop cannot lose the VM.
        session.enter(MigrationPhase::Activating);
        let vm_id = session.source_vm.id();
        session
            .destination_vm
            .set_dirty_rate(session.source_vm.dirty_rate_pps());
        session.destination_host.activate(vm_id)?;
        session.source_host.evict(vm_id).await?;

        Ok(StrategyOutcome {
            stop_reason,
            final_copy_pages,
            demand_faults: 0,
            zero_pages_skipped: 0,
        })
    }
}
