//! Rendezvous context
//!
//! The process-wide state of the rendezvous engine: the semaphore pool, the
//! token list, the per-CPU work slots, and the election bookkeeping. One
//! context describes one machine; tests build several of them to simulate
//! multi-processor runs side by side.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use spin::{Mutex, RwLock};

use crate::platform::{Platform, ProcessorInfo};
use crate::pool::SemaphorePool;
use crate::status::StatusSlot;
use crate::sync::{release_semaphore, wait_for_semaphore, SpinLock};
use crate::token::{TokenHandle, TokenList};
use crate::{config, Procedure, ProcedureArg, SmmEntryPoint};

/// Value of `bsp_index` while no BSP is elected.
pub(crate) const BSP_UNELECTED: u32 = u32::MAX;

/// When the BSP gathers the APs relative to running the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Gather every AP before the dispatcher runs.
    #[default]
    Traditional,
    /// Run the dispatcher first, gather the APs at exit.
    Relaxed,
}

#[derive(Clone, Debug)]
pub struct MpConfig {
    pub enable_bsp_election: bool,
    pub block_startup_this_ap: bool,
    pub sync_mode: SyncMode,
    pub token_count_per_chunk: u32,
    pub hot_plug_support: bool,
    pub smm_debug: bool,
    pub profile_enable: bool,
    /// Whether per-dispatch timeouts are supported. The engine only surfaces
    /// the capability bit, enforcement is the dispatcher's concern.
    pub timeout_supported: bool,
    /// Whether SMBASE relocation already happened, so the first SMI of each
    /// processor runs the init handler instead of the rendezvous.
    pub smm_relocated: bool,
}

impl Default for MpConfig {
    fn default() -> Self {
        Self {
            enable_bsp_election: true,
            block_startup_this_ap: false,
            sync_mode: SyncMode::Traditional,
            token_count_per_chunk: config::DEFAULT_TOKEN_COUNT_PER_CHUNK,
            hot_plug_support: false,
            smm_debug: false,
            profile_enable: false,
            timeout_supported: false,
            smm_relocated: false,
        }
    }
}

/// Context handed to the dispatcher entry point.
pub struct SmmEntryContext {
    pub currently_executing_cpu: AtomicUsize,
    pub number_of_cpus: usize,
}

// ——————————————————————————— Per-CPU work slot ———————————————————————————— //

/// The work item currently dispatched to a CPU. The CPU's `busy` lock is the
/// protocol-level guard; this mutex only keeps the slot itself coherent.
#[derive(Default)]
pub(crate) struct WorkSlot {
    pub procedure: Option<Procedure>,
    pub parameter: Option<ProcedureArg>,
    pub status: Option<Arc<StatusSlot>>,
    pub token: Option<TokenHandle>,
}

#[derive(Default)]
pub(crate) struct CpuData {
    pub work: Mutex<WorkSlot>,
}

// —————————————————————————— Rendezvous context ———————————————————————————— //

pub struct MpRendezvous<P: Platform> {
    pub(crate) platform: P,
    pub(crate) config: MpConfig,
    processors: Vec<ProcessorInfo>,
    number_of_cpus: usize,
    pub(crate) pool: SemaphorePool,
    pub(crate) tokens: TokenList,
    pub(crate) cpu_data: Vec<CpuData>,
    pub(crate) bsp_index: AtomicU32,
    pub(crate) all_ap_arrived_with_exception: AtomicBool,
    pub(crate) effective_sync_mode: SyncMode,
    pub(crate) switch_bsp: AtomicBool,
    pub(crate) candidate_bsp: Vec<AtomicBool>,
    pub(crate) startup_procedure: Mutex<Option<(Procedure, Option<ProcedureArg>)>>,
    pub(crate) core_entry: Mutex<Option<SmmEntryPoint<P>>>,
    pub(crate) entry_context: SmmEntryContext,
    /// MTRR values installed for the duration of the SMI, recorded at init.
    pub(crate) smi_mtrrs: RwLock<P::Mtrrs>,
    pub(crate) machine_check_supported: bool,
    package_first_thread: Vec<AtomicU32>,
    pub(crate) removal_pending: Vec<AtomicBool>,
    pub(crate) smm_initialized: Vec<AtomicBool>,
}

impl<P: Platform> MpRendezvous<P> {
    /// Builds the rendezvous context for the processors described by
    /// `processors` (one slot per possible CPU, absent slots carry an invalid
    /// APIC id). Must run before the first SMI is taken.
    pub fn new(platform: P, config: MpConfig, processors: Vec<ProcessorInfo>) -> Self {
        let max_number_of_cpus = processors.len();
        assert!(max_number_of_cpus > 0, "At least one processor is required");
        let number_of_cpus = processors.iter().filter(|p| p.is_valid()).count();
        assert!(number_of_cpus > 0, "At least one valid processor is required");

        let machine_check_supported = platform.machine_check_supported();
        let pool = SemaphorePool::new(max_number_of_cpus);
        let tokens = TokenList::new(config.token_count_per_chunk);

        let packages = processors
            .iter()
            .filter(|p| p.is_valid())
            .map(|p| p.package as usize)
            .max()
            .unwrap_or(0)
            + 1;

        let bsp_index = if config.enable_bsp_election {
            BSP_UNELECTED
        } else {
            0
        };

        // The MTRR values in place at init time are the ones SMM runs under.
        let smi_mtrrs = RwLock::new(platform.mtrr_get_all(0));

        log::info!(
            "SmmCpu: {} of {} processor slots populated, sync mode {:?}",
            number_of_cpus,
            max_number_of_cpus,
            config.sync_mode
        );

        Self {
            effective_sync_mode: config.sync_mode,
            cpu_data: (0..max_number_of_cpus).map(|_| CpuData::default()).collect(),
            candidate_bsp: (0..max_number_of_cpus).map(|_| AtomicBool::new(false)).collect(),
            removal_pending: (0..max_number_of_cpus).map(|_| AtomicBool::new(false)).collect(),
            smm_initialized: (0..max_number_of_cpus).map(|_| AtomicBool::new(false)).collect(),
            package_first_thread: (0..packages).map(|_| AtomicU32::new(u32::MAX)).collect(),
            entry_context: SmmEntryContext {
                currently_executing_cpu: AtomicUsize::new(usize::MAX),
                number_of_cpus,
            },
            bsp_index: AtomicU32::new(bsp_index),
            all_ap_arrived_with_exception: AtomicBool::new(false),
            switch_bsp: AtomicBool::new(false),
            startup_procedure: Mutex::new(None),
            core_entry: Mutex::new(None),
            smi_mtrrs,
            machine_check_supported,
            platform,
            config,
            processors,
            number_of_cpus,
            pool,
            tokens,
        }
    }

    // ———————————————————————————— Public state ———————————————————————————— //

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn number_of_cpus(&self) -> usize {
        self.number_of_cpus
    }

    pub fn max_number_of_cpus(&self) -> usize {
        self.processors.len()
    }

    pub fn processor_info(&self, cpu: usize) -> ProcessorInfo {
        self.processors[cpu]
    }

    pub fn counter(&self) -> u32 {
        self.pool.counter().load(Ordering::SeqCst)
    }

    pub fn inside_smm(&self) -> bool {
        self.pool.inside_smm().load(Ordering::SeqCst)
    }

    pub fn all_cpus_in_sync(&self) -> bool {
        self.pool.all_cpus_in_sync().load(Ordering::SeqCst)
    }

    pub fn is_present(&self, cpu: usize) -> bool {
        self.pool.present(cpu).load(Ordering::SeqCst)
    }

    /// The elected BSP of the current SMI run, if any.
    pub fn bsp_index(&self) -> Option<usize> {
        let raw = self.bsp_index.load(Ordering::SeqCst);
        (raw != BSP_UNELECTED).then_some(raw as usize)
    }

    pub fn all_ap_arrived_with_exception(&self) -> bool {
        self.all_ap_arrived_with_exception.load(Ordering::SeqCst)
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.effective_sync_mode
    }

    /// Cursor position of the token list, the head means all tokens free.
    pub fn first_free_token(&self) -> usize {
        self.tokens.first_free()
    }

    pub fn entry_context(&self) -> &SmmEntryContext {
        &self.entry_context
    }

    /// Lock serializing the SMM page fault handler.
    pub fn page_fault_lock(&self) -> &SpinLock {
        self.pool.page_fault_lock()
    }

    /// Lock serializing the code access check configuration.
    pub fn code_access_check_lock(&self) -> &SpinLock {
        self.pool.code_access_check_lock()
    }

    /// Marks a processor as scheduled for hot-plug removal; such processors
    /// are rejected as dispatch targets.
    pub fn set_removal_pending(&self, cpu: usize, pending: bool) {
        self.removal_pending[cpu].store(pending, Ordering::SeqCst);
    }

    /// Requests that the next SMI elects its BSP among `candidates` only.
    pub fn request_bsp_switch(&self, candidates: &[usize]) {
        for &cpu in candidates {
            self.candidate_bsp[cpu].store(true, Ordering::SeqCst);
        }
        self.switch_bsp.store(true, Ordering::SeqCst);
    }

    // ——————————————————————————— Shared helpers ——————————————————————————— //

    /// Whether `cpu` is a present AP: checked in and not the coordinator.
    pub(crate) fn is_present_ap(&self, cpu: usize) -> bool {
        cpu != self.entry_context.currently_executing_cpu.load(Ordering::SeqCst)
            && self.pool.present(cpu).load(Ordering::SeqCst)
    }

    /// Whether `cpu` is the first thread of its package to ask. The first
    /// caller for a package claims the slot, every later caller compares
    /// against it.
    pub(crate) fn is_package_first_thread(&self, cpu: usize) -> bool {
        let package = self.processors[cpu].package as usize;
        let slot = &self.package_first_thread[package];
        let _ = slot.compare_exchange(u32::MAX, cpu as u32, Ordering::SeqCst, Ordering::SeqCst);
        slot.load(Ordering::SeqCst) == cpu as u32
    }

    pub(crate) fn present_count(&self) -> usize {
        (0..self.max_number_of_cpus())
            .filter(|&cpu| self.pool.present(cpu).load(Ordering::SeqCst))
            .count()
    }

    /// Waits for `ap_count` completions. Every AP signals by releasing the
    /// BSP's own `run` semaphore, which doubles as the shared completion
    /// counter.
    pub(crate) fn wait_for_all_aps(&self, ap_count: usize) {
        let bsp = self.bsp_index.load(Ordering::SeqCst) as usize;
        for _ in 0..ap_count {
            wait_for_semaphore(self.pool.run(bsp));
        }
    }

    /// Releases the `run` semaphore of every present AP.
    pub(crate) fn release_all_aps(&self) {
        for cpu in 0..self.max_number_of_cpus() {
            if self.is_present_ap(cpu) {
                release_semaphore(self.pool.run(cpu));
            }
        }
    }

    /// Waits until no present AP holds its `busy` lock. In non-blocking mode
    /// returns false as soon as one busy AP is found.
    pub(crate) fn wait_for_all_aps_not_busy(&self, block: bool) -> bool {
        for cpu in 0..self.max_number_of_cpus() {
            if !self.is_present_ap(cpu) {
                continue;
            }

            if block {
                self.pool.busy(cpu).acquire();
                self.pool.busy(cpu).release();
            } else if self.pool.busy(cpu).try_acquire() {
                self.pool.busy(cpu).release();
            } else {
                return false;
            }
        }

        true
    }

    /// Replaces the OS MTRRs of `cpu` with the recorded SMI MTRRs.
    pub(crate) fn replace_os_mtrrs(&self, cpu: usize) {
        self.platform.disable_smrr(cpu);
        self.platform.mtrr_set_all(cpu, &self.smi_mtrrs.read());
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::*;
    use crate::platform::testing::NullPlatform;

    fn processors() -> Vec<ProcessorInfo> {
        vec![
            ProcessorInfo { apic_id: 0, package: 0 },
            ProcessorInfo { apic_id: 2, package: 0 },
            ProcessorInfo { apic_id: 4, package: 1 },
            ProcessorInfo { apic_id: 6, package: 1 },
        ]
    }

    #[test]
    fn package_first_thread_is_claimed_once() {
        let mp = MpRendezvous::new(NullPlatform, MpConfig::default(), processors());

        // CPU 1 asks first and claims package 0.
        assert!(mp.is_package_first_thread(1));
        assert!(!mp.is_package_first_thread(0));
        assert!(mp.is_package_first_thread(1));

        assert!(mp.is_package_first_thread(2));
        assert!(!mp.is_package_first_thread(3));
    }

    #[test]
    fn new_context_is_idle() {
        let mp = MpRendezvous::new(NullPlatform, MpConfig::default(), processors());
        assert_eq!(mp.counter(), 0);
        assert!(!mp.inside_smm());
        assert!(!mp.all_cpus_in_sync());
        assert_eq!(mp.bsp_index(), None);
        assert_eq!(mp.first_free_token(), 0);
        assert_eq!(mp.number_of_cpus(), 4);
    }

    #[test]
    fn disabled_election_pins_the_bsp() {
        let config = MpConfig {
            enable_bsp_election: false,
            ..MpConfig::default()
        };
        let mp = MpRendezvous::new(NullPlatform, config, processors());
        assert_eq!(mp.bsp_index(), Some(0));
    }
}
