//! # Trace Session
//!
//! Everything the tracer knows about one traced process: its pid, its instruction set and the
//! breakpoints planned for it.
//!
//! Planning is a pure function of the symbol list, the bias and the
//! [`RoutingTable`](crate::routing::RoutingTable), see [`plan_breakpoints`]. Breakpoints are
//! installed once at the initial stop and afterwards only uninstalled and reinstalled by the
//! control loop.

use std::collections::{HashMap, HashSet};

use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::addr::Addr;
use crate::breakpoint::{Arch, Breakpoint, TextMemory};
use crate::outcome::{HitCount, Outcome, TraceReport};
use crate::routing::RoutingTable;
use crate::symbols::{address_index, Symbol};

/// Plans one breakpoint per runtime address of every symbol the table intercepts
///
/// The redirect target of a site is the runtime address of the symbol its name resolves to.
/// No redirect is planned when that symbol does not exist or is the intercepted function
/// itself; such sites only observe the call.
pub fn plan_breakpoints(
    symbols: &[Symbol],
    bias: Addr,
    table: &RoutingTable,
) -> Vec<Breakpoint> {
    let by_name = address_index(symbols);
    let mut seen: HashSet<Addr> = HashSet::new();
    let mut planned = Vec::new();

    for sym in symbols {
        if !table.intercepts(&sym.name) {
            continue;
        }
        let addr = Addr::biased(sym.vaddr, bias);
        if !seen.insert(addr) {
            continue;
        }

        let target = table.resolve(&sym.name);
        let redirect = by_name
            .get(target)
            .map(|vaddr| Addr::biased(*vaddr, bias))
            .filter(|r| *r != addr);
        match redirect {
            Some(r) => debug!("planned {} at {addr} -> {target} at {r}", sym.name),
            None if target != sym.name => {
                debug!(
                    "planned {} at {addr}, target {target} not found, intercepting only",
                    sym.name
                )
            }
            None => debug!("planned {} at {addr}, intercepting only", sym.name),
        }
        planned.push(Breakpoint::new(addr, sym.name.clone(), redirect));
    }

    planned
}

/// State of one traced process
#[derive(Debug)]
pub struct TraceSession {
    pid: Pid,
    arch: Arch,
    breakpoints: HashMap<Addr, Breakpoint>,
}

impl TraceSession {
    pub fn new(pid: Pid, arch: Arch, planned: Vec<Breakpoint>) -> Self {
        Self {
            pid,
            arch,
            breakpoints: planned.into_iter().map(|bp| (bp.addr(), bp)).collect(),
        }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn breakpoint(&self, site: Addr) -> Option<&Breakpoint> {
        self.breakpoints.get(&site)
    }

    /// Installs every planned breakpoint and returns how many were installed
    ///
    /// A site that cannot be patched is reported and left out; the others are still installed.
    pub fn install_all(&mut self, mem: &mut impl TextMemory) -> usize {
        let mut installed = 0;
        for bp in self.breakpoints.values_mut() {
            match bp.install(self.arch, mem) {
                Ok(_) => installed += 1,
                Err(e) => error!(
                    "could not set breakpoint for {} at {}: {e}",
                    bp.symbol(),
                    bp.addr()
                ),
            }
        }
        info!(
            "installed {installed} of {} breakpoints",
            self.breakpoints.len()
        );
        installed
    }

    /// Maps the instruction pointer after a trap to the breakpoint site that caused it
    pub fn site_for_pc(&self, pc: Addr) -> Option<Addr> {
        let site = pc - self.arch.trap_pc_offset();
        self.breakpoints.contains_key(&site).then_some(site)
    }

    /// Counts a hit on `site` and puts its original bytes back
    ///
    /// Returns the redirect target of the site; `None` means the original function should run.
    pub fn take_hit(&mut self, site: Addr, mem: &mut impl TextMemory) -> Option<Addr> {
        let bp = self.breakpoints.get_mut(&site)?;
        bp.record_hit();
        if let Err(e) = bp.restore(self.arch, mem) {
            warn!("could not restore {} at {site}: {e}", bp.symbol());
        }
        bp.redirect()
    }

    /// Installs the breakpoint at `site` again
    pub fn rearm(&mut self, site: Addr, mem: &mut impl TextMemory) {
        let Some(bp) = self.breakpoints.get_mut(&site) else {
            return;
        };
        if let Err(e) = bp.install(self.arch, mem) {
            warn!("could not rearm {} at {site}: {e}", bp.symbol());
        }
    }

    /// Forgets all breakpoints, for when the process replaced its image
    pub fn discard_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    pub fn report(&self, outcome: Outcome) -> TraceReport {
        let mut hits: Vec<HitCount> = self
            .breakpoints
            .values()
            .map(|bp| HitCount {
                symbol: bp.symbol().to_string(),
                hits: bp.hits(),
            })
            .collect();
        hits.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        TraceReport { outcome, hits }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::breakpoint::test::FakeText;

    fn sym(name: &str, vaddr: u64) -> Symbol {
        Symbol {
            name: name.to_string(),
            vaddr,
        }
    }

    fn symbols() -> Vec<Symbol> {
        vec![
            sym("foo", 0x1100),
            sym("bar", 0x1200),
            sym("baz", 0x1300),
            sym("foo_one", 0x1400),
            sym("foo_two", 0x1500),
            sym("main", 0x1600),
        ]
    }

    #[test]
    fn test_plan_redirect() {
        let table = RoutingTable::parse(r#"{"bar": "baz"}"#);
        let bias = Addr::from(0x5555_0000_0000u64);
        let plan = plan_breakpoints(&symbols(), bias, &table);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].symbol(), "bar");
        assert_eq!(plan[0].addr(), Addr::from(0x5555_0000_1200u64));
        assert_eq!(plan[0].redirect(), Some(Addr::from(0x5555_0000_1300u64)));
    }

    #[test]
    fn test_plan_self_and_missing_targets_only_intercept() {
        let table = RoutingTable::parse(r#"{"foo": "foo", "bar": "nowhere"}"#);
        let plan = plan_breakpoints(&symbols(), Addr::NULL, &table);
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|bp| bp.redirect().is_none()));
    }

    #[test]
    fn test_plan_pattern() {
        let table = RoutingTable::parse(r#"{"foo_*": "baz"}"#);
        let plan = plan_breakpoints(&symbols(), Addr::NULL, &table);
        let names: Vec<&str> = plan.iter().map(|bp| bp.symbol()).collect();
        assert_eq!(names, ["foo_one", "foo_two"]);
        assert!(plan
            .iter()
            .all(|bp| bp.redirect() == Some(Addr::from(0x1300u64))));
    }

    #[test]
    fn test_plan_pattern_without_match() {
        let table = RoutingTable::parse(r#"{"zzz_*": "other"}"#);
        assert!(plan_breakpoints(&symbols(), Addr::NULL, &table).is_empty());
    }

    #[test]
    fn test_plan_deduplicates_sites() {
        let mut syms = symbols();
        // the same function in .symtab and .dynsym
        syms.push(sym("bar", 0x1200));
        let table = RoutingTable::parse(r#"{"bar": "baz", "b*": "foo"}"#);
        let plan = plan_breakpoints(&syms, Addr::NULL, &table);
        let bar: Vec<_> = plan.iter().filter(|bp| bp.symbol() == "bar").collect();
        assert_eq!(bar.len(), 1);
        assert_eq!(bar[0].redirect(), Some(Addr::from(0x1300u64)));
        // baz itself is matched by the pattern and routed to foo
        let baz = plan.iter().find(|bp| bp.symbol() == "baz").unwrap();
        assert_eq!(baz.redirect(), Some(Addr::from(0x1100u64)));
    }

    #[test]
    fn test_site_for_pc() {
        let bp = Breakpoint::new(Addr::from(0x1200u64), "bar", None);
        let x86 = TraceSession::new(Pid::this(), Arch::X86_64, vec![bp.clone()]);
        assert_eq!(
            x86.site_for_pc(Addr::from(0x1201u64)),
            Some(Addr::from(0x1200u64))
        );
        assert_eq!(x86.site_for_pc(Addr::from(0x1200u64)), None);

        let arm = TraceSession::new(Pid::this(), Arch::Aarch64, vec![bp]);
        assert_eq!(
            arm.site_for_pc(Addr::from(0x1200u64)),
            Some(Addr::from(0x1200u64))
        );
        assert_eq!(arm.site_for_pc(Addr::from(0x1201u64)), None);
    }

    #[test]
    fn test_hit_restores_and_rearm_reinstalls() {
        let original: i64 = 0x0102_0304_0506_0708;
        let mut text = FakeText::with_word(0x1200, original);
        let redirect = Some(Addr::from(0x1300u64));
        let bp = Breakpoint::new(Addr::from(0x1200u64), "bar", redirect);
        let mut session = TraceSession::new(Pid::this(), Arch::X86_64, vec![bp]);

        assert_eq!(session.install_all(&mut text), 1);
        assert_eq!(text.get(0x1200), Arch::X86_64.patch(original));

        let site = Addr::from(0x1200u64);
        assert_eq!(session.take_hit(site, &mut text), redirect);
        assert_eq!(text.get(0x1200), original);

        session.rearm(site, &mut text);
        assert_eq!(text.get(0x1200), Arch::X86_64.patch(original));
        assert_eq!(session.report(Outcome::Exited(0)).hits_of("bar"), 1);
    }

    #[test]
    fn test_install_failures_do_not_stop_others() {
        let mut text = FakeText::default();
        text.fail_writes = true;
        let planned = vec![
            Breakpoint::new(Addr::from(0x1100u64), "foo", None),
            Breakpoint::new(Addr::from(0x1200u64), "bar", None),
        ];
        let mut session = TraceSession::new(Pid::this(), Arch::X86_64, planned);
        assert_eq!(session.install_all(&mut text), 0);
        assert!(session.breakpoints().all(|bp| !bp.is_installed()));
    }
}
