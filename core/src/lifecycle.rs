//! Task and thread lifecycle (spec.md §4.6): creation, and the exit
//! cascade that tears an address space, phone table, and answerbox back
//! down.
//!
//! Grounded on the teacher's `scheduler/lifecycle.rs` for the shape of the
//! boot-step/teardown sequence, re-pointed at `mk-mm`'s
//! `AddressSpaceManager` and `mk-ipc`'s `IpcCore`/`PhoneTable` instead of
//! the teacher's page-directory and no-IPC-layer equivalents.

use mk_abi::error::{KError, KResult};
use mk_abi::mm::Asid;
use mk_abi::task::{PRIORITY_HIGHEST, TaskId, ThreadId, ThreadState};
use mk_ipc::{IpcCore, IrqTable};
use mk_lib::{WaitQueue, klog_debug};
use mk_mm::address_space::AddressSpaceManager;

use crate::scheduler::scheduler;
use crate::task::TaskTable;

/// Everything one kernel instance owns above the scheduler: the task
/// table, the address-space manager, and the process-wide IPC tables.
pub struct Kernel {
    pub tasks: TaskTable,
    pub address_spaces: AddressSpaceManager,
    pub ipc: IpcCore,
    pub irq: IrqTable,
    /// Woken whenever any thread reaches `Lingering`, so `thread_join`
    /// (`mk-kernel`) can block on a shared queue rather than needing a
    /// dedicated wait queue per thread (spec.md doesn't specify a join
    /// primitive beyond "blocks until exit"; this is the simplification,
    /// the same way `call_sync` simplifies multi-tenant reply boxes in
    /// `mk-ipc`).
    pub join_notify: WaitQueue,
}

impl Kernel {
    pub fn new(asid_pool_capacity: usize) -> Self {
        Self {
            tasks: TaskTable::new(),
            address_spaces: AddressSpaceManager::new(asid_pool_capacity),
            ipc: IpcCore::new(),
            irq: IrqTable::new(),
            join_notify: WaitQueue::new(),
        }
    }

    /// Create a new task: an address space, an answerbox, a task record,
    /// and its first thread (spawned at the default band, since there is
    /// no creating thread to inherit from).
    pub fn task_create(&self, name: &str, home_cpu: usize) -> KResult<(TaskId, ThreadId)> {
        let asid = self
            .address_spaces
            .as_create(|victim, policy| self.shootdown(victim, policy))?;
        let answerbox = match self.ipc.answerboxes.create() {
            Ok(bx) => bx,
            Err(e) => {
                let _ = self.address_spaces.as_destroy(asid);
                return Err(e);
            }
        };
        let task = match self.tasks.create(asid, answerbox, name) {
            Ok(t) => t,
            Err(e) => {
                let _ = self.ipc.answerboxes.destroy(answerbox);
                let _ = self.address_spaces.as_destroy(asid);
                return Err(e);
            }
        };
        let thread = self.spawn_thread_for(task, PRIORITY_HIGHEST + 1, home_cpu)?;
        klog_debug!("lifecycle: created task {:?} ({})", task, name);
        Ok((task, thread))
    }

    /// Create an additional thread for an existing task, inheriting
    /// `inherited_band` from its creating thread (spec.md: "a new thread
    /// inherits its creating thread's band").
    pub fn thread_create(
        &self,
        task: TaskId,
        inherited_band: u8,
        home_cpu: usize,
    ) -> KResult<ThreadId> {
        self.spawn_thread_for(task, inherited_band, home_cpu)
    }

    fn spawn_thread_for(&self, task: TaskId, band: u8, home_cpu: usize) -> KResult<ThreadId> {
        let thread = scheduler().spawn_thread(task, band, home_cpu)?;
        if let Err(e) = self.tasks.add_thread(task, thread) {
            let _ = scheduler().threads().destroy(thread);
            return Err(e);
        }
        Ok(thread)
    }

    /// Exit a single thread. If it was the task's last thread, cascades
    /// into the full task teardown (spec.md: "a task-wide exit walks all
    /// its threads").
    pub fn thread_exit(&self, thread: ThreadId) -> KResult<()> {
        let record = scheduler().threads().get(thread).ok_or(KError::NoEnt)?;
        let task = record.task;
        scheduler().threads().transition(thread, ThreadState::Exiting)?;
        scheduler().threads().transition(thread, ThreadState::Lingering)?;
        let remaining = self.tasks.remove_thread(task, thread)?;
        klog_debug!("lifecycle: thread {:?} exited, task has {} left", thread, remaining);
        self.join_notify.wake_all();
        if remaining == 0 {
            self.task_exit(task)?;
        }
        Ok(())
    }

    /// Tear a task down: interrupt every remaining thread, hang up every
    /// phone it held, drain and close its answerbox, and release its
    /// address space (recycling the ASID).
    pub fn task_exit(&self, task: TaskId) -> KResult<()> {
        let (threads, count, asid, answerbox) = self
            .tasks
            .with_task(task, |t| {
                let (threads, count) = t.snapshot_threads();
                (threads, count, t.asid, t.answerbox)
            })?;

        for &thread in &threads[..count] {
            let _ = scheduler().interrupt(thread);
        }

        self.tasks.with_task(task, |t| {
            t.phones.for_each_connected(|phone| {
                let _ = self.ipc.hangup(&t.phones, phone);
            });
        })?;

        self.ipc.close_answerbox(answerbox);
        self.address_spaces.as_destroy(asid)?;
        self.tasks.destroy(task)?;
        klog_debug!("lifecycle: task {:?} fully torn down", task);
        Ok(())
    }

    /// ASID-exhaustion eviction callback handed to `AddressSpaceManager`:
    /// the actual TLB shootdown is arch territory (out of scope); logging
    /// it here documents the policy decision without fabricating the
    /// hardware call.
    fn shootdown(&self, victim: Asid, policy: mk_mm::asid::ShootdownPolicy) {
        klog_debug!("lifecycle: asid {} evicted ({:?})", victim.0, policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_create_spawns_task_and_primary_thread() {
        let kernel = Kernel::new(64);
        let (task, thread) = kernel.task_create("init", 0).unwrap();
        let record = scheduler().threads().get(thread).unwrap();
        assert_eq!(record.task, task);
        assert_eq!(record.state, ThreadState::Ready);
    }

    #[test]
    fn thread_exit_of_last_thread_cascades_to_task_teardown() {
        let kernel = Kernel::new(64);
        let (task, thread) = kernel.task_create("solo", 0).unwrap();
        let asid = kernel.tasks.with_task(task, |t| t.asid).unwrap();
        kernel.thread_exit(thread).unwrap();
        assert!(kernel.tasks.with_task(task, |_| ()).is_err());
        assert!(kernel.address_spaces.with_address_space(asid, |_| ()).is_err());
    }

    #[test]
    fn thread_exit_wakes_join_notify() {
        let kernel = Kernel::new(64);
        let (_, thread) = kernel.task_create("solo", 0).unwrap();
        assert_eq!(kernel.join_notify.missed_wakeups(), 0);
        kernel.thread_exit(thread).unwrap();
        // no joiner was sleeping, so the wake is banked as a missed wakeup.
        assert_eq!(kernel.join_notify.missed_wakeups(), 1);
    }

    #[test]
    fn thread_exit_with_siblings_keeps_task_alive() {
        let kernel = Kernel::new(64);
        let (task, thread1) = kernel.task_create("multi", 0).unwrap();
        let thread2 = kernel.thread_create(task, PRIORITY_HIGHEST, 0).unwrap();
        kernel.thread_exit(thread1).unwrap();
        assert!(kernel.tasks.with_task(task, |_| ()).is_ok());
        assert_ne!(thread1, thread2);
    }

    #[test]
    fn task_exit_hangs_up_phones_and_drains_answerbox() {
        let kernel = Kernel::new(64);
        let (server_task, _) = kernel.task_create("server", 0).unwrap();
        let (client_task, client_thread) = kernel.task_create("client", 0).unwrap();

        let server_box = kernel.tasks.with_task(server_task, |t| t.answerbox).unwrap();
        let client_box = kernel.tasks.with_task(client_task, |t| t.answerbox).unwrap();
        let phone = kernel
            .tasks
            .with_task(client_task, |t| t.phones.connect(server_box))
            .unwrap()
            .unwrap();
        let payload = mk_abi::ipc::IpcPayload::new(1, [0; 5]);
        kernel
            .tasks
            .with_task(client_task, |t| {
                kernel
                    .ipc
                    .call_async(&t.phones, phone, payload, client_box)
            })
            .unwrap()
            .unwrap();

        kernel.thread_exit(client_thread).unwrap();
        assert!(kernel.ipc.answerboxes.get(server_box).is_some());
        // the outstanding call landed on the server's answerbox and is
        // still there; tearing down the client does not touch it.
        assert!(kernel.ipc.answerboxes.get(client_box).is_none());
    }
}
