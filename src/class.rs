//! Closed sets of outcomes and rejection reasons.
//!
//! Both sets are fixed when a guard rail is built. Members are represented
//! as small indices into a fixed table so counters and recorders can use
//! array indexing instead of hashing on the hot path.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CLASS_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_class_id() -> u64 {
    NEXT_CLASS_ID.fetch_add(1, Ordering::Relaxed)
}

/// A member of a [`ResultClass`].
///
/// Cheap to clone; equality is identity within the owning class, so tokens
/// from different classes never compare equal even when names collide.
#[derive(Debug, Clone)]
pub struct Outcome {
    class_id: u64,
    index: u16,
    failure: bool,
    name: Arc<str>,
}

impl Outcome {
    /// Position of this outcome in its class table.
    pub fn index(&self) -> usize {
        usize::from(self.index)
    }

    /// Whether this outcome counts as a failure for breaker health.
    pub fn is_failure(&self) -> bool {
        self.failure
    }

    /// The user-supplied name of this outcome.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Outcome {
    fn eq(&self, other: &Self) -> bool {
        self.class_id == other.class_id && self.index == other.index
    }
}

impl Eq for Outcome {}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A member of a [`RejectionClass`], returned when back-pressure denies an
/// acquire.
#[derive(Debug, Clone)]
pub struct Reason {
    class_id: u64,
    index: u16,
    name: Arc<str>,
}

impl Reason {
    /// Position of this reason in its class table.
    pub fn index(&self) -> usize {
        usize::from(self.index)
    }

    /// The user-supplied name of this reason.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Reason {
    fn eq(&self, other: &Self) -> bool {
        self.class_id == other.class_id && self.index == other.index
    }
}

impl Eq for Reason {}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

struct OutcomeDef {
    name: Arc<str>,
    failure: bool,
}

struct ResultClassInner {
    id: u64,
    members: Vec<OutcomeDef>,
}

/// A closed, finite set of outcomes, each tagged success or failure.
#[derive(Clone)]
pub struct ResultClass {
    inner: Arc<ResultClassInner>,
}

impl ResultClass {
    /// Starts building a result class.
    pub fn builder() -> ResultClassBuilder {
        ResultClassBuilder {
            members: Vec::new(),
        }
    }

    /// Number of outcomes in the class.
    pub fn len(&self) -> usize {
        self.inner.members.len()
    }

    /// True when the class has no members. Never true for a built class.
    pub fn is_empty(&self) -> bool {
        self.inner.members.is_empty()
    }

    /// Looks up an outcome token by name.
    pub fn outcome(&self, name: &str) -> Option<Outcome> {
        self.inner
            .members
            .iter()
            .position(|m| &*m.name == name)
            .map(|i| self.outcome_at(i))
    }

    /// Returns the outcome token at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn outcome_at(&self, index: usize) -> Outcome {
        let def = &self.inner.members[index];
        Outcome {
            class_id: self.inner.id,
            index: index as u16,
            failure: def.failure,
            name: Arc::clone(&def.name),
        }
    }

    /// Iterates all outcome tokens in registration order.
    pub fn outcomes(&self) -> impl Iterator<Item = Outcome> + '_ {
        (0..self.len()).map(|i| self.outcome_at(i))
    }

    /// Whether `outcome` belongs to this class.
    pub fn contains(&self, outcome: &Outcome) -> bool {
        outcome.class_id == self.inner.id && outcome.index() < self.len()
    }

    /// Renders the member list as `[a, b, c]` for diagnostics.
    pub fn member_list(&self) -> String {
        let names: Vec<&str> = self.inner.members.iter().map(|m| &*m.name).collect();
        format!("[{}]", names.join(", "))
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn is_failure_index(&self, index: usize) -> bool {
        self.inner.members[index].failure
    }
}

impl fmt::Debug for ResultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultClass")
            .field("members", &self.member_list())
            .finish()
    }
}

/// Builder for [`ResultClass`]. Members keep registration order.
pub struct ResultClassBuilder {
    members: Vec<OutcomeDef>,
}

impl ResultClassBuilder {
    /// Adds an outcome tagged as a success.
    pub fn success(mut self, name: &str) -> Self {
        self.push(name, false);
        self
    }

    /// Adds an outcome tagged as a failure.
    pub fn failure(mut self, name: &str) -> Self {
        self.push(name, true);
        self
    }

    fn push(&mut self, name: &str, failure: bool) {
        assert!(!name.is_empty(), "outcome name must not be empty");
        assert!(
            !self.members.iter().any(|m| &*m.name == name),
            "duplicate outcome name '{name}'"
        );
        self.members.push(OutcomeDef {
            name: Arc::from(name),
            failure,
        });
    }

    /// Finishes the class.
    ///
    /// # Panics
    ///
    /// Panics if no members were added or more than `u16::MAX` were.
    pub fn build(self) -> ResultClass {
        assert!(!self.members.is_empty(), "result class must not be empty");
        assert!(
            self.members.len() <= usize::from(u16::MAX),
            "result class too large"
        );
        ResultClass {
            inner: Arc::new(ResultClassInner {
                id: fresh_class_id(),
                members: self.members,
            }),
        }
    }
}

struct RejectionClassInner {
    id: u64,
    members: Vec<Arc<str>>,
}

/// A closed, finite set of rejection reasons.
#[derive(Clone)]
pub struct RejectionClass {
    inner: Arc<RejectionClassInner>,
}

impl RejectionClass {
    /// Starts building a rejection class.
    pub fn builder() -> RejectionClassBuilder {
        RejectionClassBuilder {
            members: Vec::new(),
        }
    }

    /// Number of reasons in the class.
    pub fn len(&self) -> usize {
        self.inner.members.len()
    }

    /// True when the class has no members. Never true for a built class.
    pub fn is_empty(&self) -> bool {
        self.inner.members.is_empty()
    }

    /// Looks up a reason token by name.
    pub fn reason(&self, name: &str) -> Option<Reason> {
        self.inner
            .members
            .iter()
            .position(|m| &**m == name)
            .map(|i| self.reason_at(i))
    }

    /// Returns the reason token at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn reason_at(&self, index: usize) -> Reason {
        Reason {
            class_id: self.inner.id,
            index: index as u16,
            name: Arc::clone(&self.inner.members[index]),
        }
    }

    /// Whether `reason` belongs to this class.
    pub fn contains(&self, reason: &Reason) -> bool {
        reason.class_id == self.inner.id && reason.index() < self.len()
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }
}

impl fmt::Debug for RejectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.inner.members.iter().map(|m| &**m).collect();
        f.debug_struct("RejectionClass")
            .field("members", &names)
            .finish()
    }
}

/// Builder for [`RejectionClass`]. Members keep registration order.
pub struct RejectionClassBuilder {
    members: Vec<Arc<str>>,
}

impl RejectionClassBuilder {
    /// Adds a rejection reason.
    pub fn reason(mut self, name: &str) -> Self {
        assert!(!name.is_empty(), "reason name must not be empty");
        assert!(
            !self.members.iter().any(|m| &**m == name),
            "duplicate reason name '{name}'"
        );
        self.members.push(Arc::from(name));
        self
    }

    /// Finishes the class.
    ///
    /// # Panics
    ///
    /// Panics if no members were added or more than `u16::MAX` were.
    pub fn build(self) -> RejectionClass {
        assert!(!self.members.is_empty(), "rejection class must not be empty");
        assert!(
            self.members.len() <= usize::from(u16::MAX),
            "rejection class too large"
        );
        RejectionClass {
            inner: Arc::new(RejectionClassInner {
                id: fresh_class_id(),
                members: self.members,
            }),
        }
    }
}
