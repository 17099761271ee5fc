use crate::arena::{TermArena, TermId};
use crate::engine::forms::ContextHandler;
use crate::engine::reduce::default_reduce_once;
use crate::env::EnvRef;
use crate::error::EvalResult;
use std::collections::VecDeque;

/// Outcome of a single reduction step.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReductionStatus {
    /// No further reduction is required; the term is kept as-is.
    Retained,
    /// The step finished without producing a regular form of its own.
    Neutral,
    /// More work was queued; the trampoline must resume.
    Partial,
    /// A regular form was produced.
    Regular,
}

/// Whether `status` mandates a further reduction.
pub fn check_reducible(status: ReductionStatus) -> bool {
    matches!(status, ReductionStatus::Partial)
}

/// A queued continuation. Continuations capture term ids, never borrows,
/// so the queue owns no part of the tree.
pub type Reducer = Box<dyn FnOnce(&mut Context) -> EvalResult<ReductionStatus>>;

pub type ReduceOnceFn = fn(TermId, &mut Context) -> EvalResult<ReductionStatus>;

/// Per-evaluation state: the term arena, the record (current) environment,
/// the front-queue of continuations, and the tail-call support block.
///
/// The queue is LIFO through `setup_front`: the last continuation
/// scheduled runs first. A rewrite either returns a terminal status or
/// schedules more continuations and reports `Partial`; the driver in
/// `rewrite_term` pops until the queue drains.
pub struct Context {
    pub arena: TermArena,
    pub record: EnvRef,
    queue: VecDeque<Reducer>,
    next_term: TermId,
    pub last_status: ReductionStatus,
    pub reduce_once: ReduceOnceFn,
    pub step_limit: usize,
    pub steps: usize,
    pub step_limit_hit: bool,
    tco: Option<TcoAction>,
}

impl Context {
    pub fn new(record: EnvRef) -> Self {
        Context {
            arena: TermArena::new(),
            record,
            queue: VecDeque::new(),
            next_term: TermId::NULL,
            last_status: ReductionStatus::Neutral,
            reduce_once: default_reduce_once,
            step_limit: usize::MAX,
            steps: 0,
            step_limit_hit: false,
            tco: None,
        }
    }

    /// Enqueue a continuation at the head of the queue.
    pub fn setup_front<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Context) -> EvalResult<ReductionStatus> + 'static,
    {
        self.queue.push_front(Box::new(f));
    }

    /// Enqueue a continuation that resumes in the current record
    /// environment, undoing any switches made by work that runs before
    /// it (a combiner body leaves the record on its local environment).
    pub fn setup_front_guarded<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Context) -> EvalResult<ReductionStatus> + 'static,
    {
        let saved = self.record.clone();
        self.setup_front(move |c| {
            c.record = saved;
            f(c)
        });
    }

    pub fn set_next_term(&mut self, term: TermId) {
        self.next_term = term;
    }

    pub fn next_term(&self) -> TermId {
        self.next_term
    }

    /// Install a continuation in tail position and yield to the
    /// trampoline.
    pub fn relay_switched<F>(&mut self, k: F) -> EvalResult<ReductionStatus>
    where
        F: FnOnce(&mut Context) -> EvalResult<ReductionStatus> + 'static,
    {
        self.setup_front(k);
        Ok(ReductionStatus::Partial)
    }

    /// Drive `term` to completion: one initial dispatch, then pop
    /// continuations from the front until the queue is empty. On error
    /// the pending continuations and any retained combiners are dropped
    /// before the error escapes to the host.
    pub fn rewrite_term(&mut self, term: TermId) -> EvalResult<ReductionStatus> {
        self.steps = 0;
        self.step_limit_hit = false;
        self.set_next_term(term);
        if crate::engine::reduce::eval_debug(1) {
            eprintln!(
                "REWRITE_BEGIN term={} kind={}",
                term.0,
                crate::engine::unparse::term_kind(&self.arena, term)
            );
        }
        let step = self.reduce_once;
        let mut status = self.guard(move |c| step(term, c))?;
        self.last_status = status;
        while let Some(act) = self.queue.pop_front() {
            if self.steps >= self.step_limit {
                self.step_limit_hit = true;
                self.unwind();
                break;
            }
            self.steps += 1;
            status = self.guard(act)?;
            self.last_status = status;
        }
        if crate::engine::reduce::eval_debug(1) {
            eprintln!(
                "REWRITE_END term={} kind={} steps={} status={:?} step_limit_hit={}",
                term.0,
                crate::engine::unparse::term_kind(&self.arena, term),
                self.steps,
                status,
                self.step_limit_hit
            );
        }
        Ok(status)
    }

    fn guard<F>(&mut self, f: F) -> EvalResult<ReductionStatus>
    where
        F: FnOnce(&mut Context) -> EvalResult<ReductionStatus>,
    {
        match f(self) {
            Ok(status) => Ok(status),
            Err(e) => {
                self.unwind();
                Err(e)
            }
        }
    }

    /// Abandon pending work: clears the queue and releases combiners
    /// retained for tail calls.
    pub fn unwind(&mut self) {
        self.queue.clear();
        self.tco = None;
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// The active tail-call action for `term`, installing a fresh one if
    /// the current action belongs to another term.
    pub fn ensure_tco_action(&mut self, term: TermId) -> &mut TcoAction {
        if self.tco.as_ref().map_or(true, |act| act.term != term) {
            self.tco = None;
        }
        self.tco.get_or_insert_with(|| TcoAction::new(term))
    }

    pub fn tco_last_function(&self) -> Option<ContextHandler> {
        self.tco.as_ref().and_then(|act| act.last_function.clone())
    }
}

/// Tail-call support: keeps handlers alive across the trampoline hop into
/// a combiner body.
pub struct TcoAction {
    pub term: TermId,
    /// The handler attached by the most recent combiner entry, if it was
    /// passed by value.
    pub last_function: Option<ContextHandler>,
    attached: Vec<ContextHandler>,
}

impl TcoAction {
    fn new(term: TermId) -> Self {
        TcoAction { term, last_function: None, attached: Vec::new() }
    }

    /// Retain an owned handler for the duration of the tail call.
    pub fn attach_function(&mut self, handler: ContextHandler) -> ContextHandler {
        self.attached.push(handler.clone());
        handler
    }
}
