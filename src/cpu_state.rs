use std::{
    cell::RefCell,
    ops::Deref,
    rc::{Rc, Weak},
};

use crate::math::{axpy_out, scalar_prods2, scalar_prods3};

/// Buffers of dropped states, waiting to be handed out again.
struct FreeList {
    states: RefCell<Vec<Rc<InnerState>>>,
}

/// Hands out phase space points and takes their buffers back when they are
/// dropped.
///
/// A trajectory of depth `d` visits up to `2^d` points and most of them are
/// discarded right away, so buffers are recycled instead of reallocated.
pub(crate) struct StatePool {
    free: Rc<FreeList>,
    dim: usize,
}

impl StatePool {
    pub(crate) fn with_capacity(dim: usize, capacity: usize) -> StatePool {
        StatePool {
            free: Rc::new(FreeList {
                states: RefCell::new(Vec::with_capacity(capacity)),
            }),
            dim,
        }
    }

    pub(crate) fn new_state(&mut self) -> State {
        let recycled = self.free.states.borrow_mut().pop();
        let inner = recycled
            .unwrap_or_else(|| Rc::new(InnerState::new(self.dim, Rc::downgrade(&self.free))));
        debug_assert_eq!(inner.q.len(), self.dim);
        State { inner: Some(inner) }
    }
}

pub(crate) struct InnerState {
    /// Momentum
    pub(crate) p: Box<[f64]>,
    /// Position
    pub(crate) q: Box<[f64]>,
    /// Velocity, the momentum multiplied by the inverse mass matrix.
    pub(crate) v: Box<[f64]>,
    /// Summed momentum between this point and the start of the trajectory.
    pub(crate) p_sum: Box<[f64]>,
    /// Gradient of the log density at `q`.
    pub(crate) grad: Box<[f64]>,
    /// Number of leapfrog steps from the start, negative when backwards.
    pub(crate) trajectory_index: i64,
    pub(crate) kinetic_energy: f64,
    pub(crate) potential_energy: f64,
    owner: Weak<FreeList>,
}

impl InnerState {
    fn new(dim: usize, owner: Weak<FreeList>) -> InnerState {
        InnerState {
            p: vec![0.; dim].into(),
            q: vec![0.; dim].into(),
            v: vec![0.; dim].into(),
            p_sum: vec![0.; dim].into(),
            grad: vec![0.; dim].into(),
            trajectory_index: 0,
            kinetic_energy: 0.,
            potential_energy: 0.,
            owner,
        }
    }

    fn copy_from(&mut self, other: &InnerState) {
        for (target, source) in [
            (&mut self.p, &other.p),
            (&mut self.q, &other.q),
            (&mut self.v, &other.v),
            (&mut self.p_sum, &other.p_sum),
            (&mut self.grad, &other.grad),
        ] {
            target.copy_from_slice(source);
        }
        self.trajectory_index = other.trajectory_index;
        self.kinetic_energy = other.kinetic_energy;
        self.potential_energy = other.potential_energy;
    }
}

/// A point in phase space.
///
/// Clones share one buffer and the buffer can only be written to while it
/// is not shared, see [`State::try_mut_inner`].
#[derive(Clone)]
pub(crate) struct State {
    inner: Option<Rc<InnerState>>,
}

impl Deref for State {
    type Target = InnerState;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref().expect("State was already dropped")
    }
}

#[derive(Debug)]
pub(crate) struct StateInUse {}

impl State {
    pub(crate) fn try_mut_inner(&mut self) -> Result<&mut InnerState, StateInUse> {
        self.inner
            .as_mut()
            .and_then(Rc::get_mut)
            .ok_or(StateInUse {})
    }

    /// Mutable access to a state that was just taken from the pool.
    pub(crate) fn inner_mut(&mut self) -> &mut InnerState {
        self.try_mut_inner().expect("State already in use")
    }

    /// A copy that does not share its buffer with `self`.
    pub(crate) fn deep_clone(&self, pool: &mut StatePool) -> State {
        let mut copy = pool.new_state();
        copy.inner_mut().copy_from(self);
        copy
    }

    /// Set `p_sum` of `next`, the neighbour of `self` one step further away
    /// from the start of the trajectory.
    pub(crate) fn extend_momentum_sum(&self, next: &mut State) {
        let next = next.inner_mut();
        debug_assert_ne!(next.trajectory_index, 0);
        if next.trajectory_index == -1 {
            next.p_sum.copy_from_slice(&next.p);
        } else {
            axpy_out(&next.p, &self.p_sum, 1., &mut next.p_sum);
        }
    }
}

impl Drop for State {
    fn drop(&mut self) {
        let Some(mut inner) = self.inner.take() else {
            return;
        };
        if Rc::get_mut(&mut inner).is_none() {
            return;
        }
        if let Some(free) = inner.owner.upgrade() {
            free.states.borrow_mut().push(inner);
        }
    }
}

impl crate::nuts::State for State {
    type Pool = StatePool;

    fn write_position(&self, out: &mut [f64]) {
        out.copy_from_slice(&self.q);
    }

    /// Generalized U-turn check between the two ends of a subtrajectory.
    ///
    /// The summed momentum between the ends is recovered from their
    /// `p_sum`, which is measured from the start of the whole trajectory.
    fn is_turning(&self, other: &Self) -> bool {
        let (left, right) = if self.trajectory_index < other.trajectory_index {
            (&**self, &**other)
        } else {
            (&**other, &**self)
        };
        let (a, b) = (left.trajectory_index, right.trajectory_index);
        assert!(a < b);

        let (dot_right, dot_left) = if a >= 0 {
            scalar_prods3(&right.p_sum, &left.p_sum, &left.p, &right.v, &left.v)
        } else if b >= 0 {
            scalar_prods2(&right.p_sum, &left.p_sum, &right.v, &left.v)
        } else {
            scalar_prods3(&left.p_sum, &right.p_sum, &right.p, &right.v, &left.v)
        };

        (dot_right < 0.) | (dot_left < 0.)
    }

    fn energy(&self) -> f64 {
        self.kinetic_energy + self.potential_energy
    }

    fn potential_energy(&self) -> f64 {
        self.potential_energy
    }

    fn index_in_trajectory(&self) -> i64 {
        self.trajectory_index
    }

    fn make_init_point(&mut self) {
        let inner = self.inner_mut();
        inner.trajectory_index = 0;
        inner.p_sum.copy_from_slice(&inner.p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nuts::State as _;
    use pretty_assertions::assert_eq;

    #[test]
    fn shared_states_are_read_only() {
        let mut pool = StatePool::with_capacity(10, 20);
        let mut state = pool.new_state();
        assert_eq!(state.p.len(), 10);
        assert!(state.try_mut_inner().is_ok());

        let mut shared = state.clone();
        assert!(state.try_mut_inner().is_err());
        assert!(shared.try_mut_inner().is_err());
        drop(state);
        assert!(shared.try_mut_inner().is_ok());
    }

    #[test]
    fn dropped_states_are_reused() {
        let mut pool = StatePool::with_capacity(3, 4);
        let mut state = pool.new_state();
        state.inner_mut().q[0] = 5.;
        drop(state);
        let state = pool.new_state();
        assert_eq!(state.q[0], 5.);
    }

    #[test]
    fn deep_clone_is_independent() {
        let mut pool = StatePool::with_capacity(2, 4);
        let mut state = pool.new_state();
        {
            let inner = state.inner_mut();
            inner.q.copy_from_slice(&[1., 2.]);
            inner.potential_energy = 3.;
            inner.kinetic_energy = 0.5;
        }
        let mut copy = state.deep_clone(&mut pool);
        copy.inner_mut().q[0] = 10.;
        assert_eq!(&state.q[..], &[1., 2.]);
        assert_eq!(copy.energy(), 3.5);
    }

    #[test]
    fn straight_line_is_not_turning() {
        let mut pool = StatePool::with_capacity(2, 4);
        let mut point = |index: i64, p: [f64; 2], p_sum: [f64; 2]| {
            let mut state = pool.new_state();
            let inner = state.inner_mut();
            inner.trajectory_index = index;
            inner.p.copy_from_slice(&p);
            inner.v.copy_from_slice(&p);
            inner.p_sum.copy_from_slice(&p_sum);
            state
        };
        let left = point(-1, [1., 0.], [1., 0.]);
        let right = point(2, [1., 0.], [3., 0.]);
        assert!(!left.is_turning(&right));
        assert!(!right.is_turning(&left));

        let reversed = point(3, [-1., 0.], [-4., 0.]);
        assert!(left.is_turning(&reversed));
    }

    #[test]
    fn momentum_sum_runs_from_start() {
        let mut pool = StatePool::with_capacity(1, 4);
        let mut start = pool.new_state();
        start.inner_mut().p[0] = 2.;
        start.make_init_point();

        let mut next = pool.new_state();
        {
            let inner = next.inner_mut();
            inner.p[0] = 3.;
            inner.trajectory_index = 1;
        }
        start.extend_momentum_sum(&mut next);
        assert_eq!(next.p_sum[0], 5.);

        let mut before = pool.new_state();
        {
            let inner = before.inner_mut();
            inner.p[0] = 7.;
            inner.trajectory_index = -1;
        }
        start.extend_momentum_sum(&mut before);
        assert_eq!(before.p_sum[0], 7.);
    }
}
