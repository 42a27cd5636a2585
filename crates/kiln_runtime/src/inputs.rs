//! Input declarations and their digests.
//!
//! An [`Inputs`] lists everything a computable's output depends on. From it
//! the orchestrator derives two digests:
//!
//! - the pre-compute digest, available before anything runs, set only when
//!   every entry (recursively, for nested computables) is known;
//! - the post-compute digest, available once dependencies have resolved,
//!   which substitutes the dependencies' output digests for the entries that
//!   were unknown.

use crate::codec::Digestible;
use crate::computable::{AnyComputable, Computable, split_type_name};
use crate::error::{ComputeError, ComputeResult};
use crate::promise::{AnyValue, Computed};
use indexmap::IndexMap;
use kiln_core::{Digest, DigestAlgorithm, DigestFrame, Digester};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::sync::Arc;

/// Name of the entry added by [`Inputs::cache_rev`]
pub const CACHE_REV_INPUT: &str = "kiln.cache-rev";

type MarshalFn = Arc<dyn Fn(&mut dyn io::Write) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
enum InputValue {
    Digest(Digest),
    Computable(Arc<dyn AnyComputable>),
    Undetermined(String),
    Invalid(String),
}

#[derive(Clone)]
struct Entry {
    name: String,
    value: InputValue,
}

#[derive(Clone)]
struct Marshaller {
    name: String,
    marshal: MarshalFn,
}

/// Declared inputs of a computable
#[derive(Clone, Default)]
pub struct Inputs {
    entries: Vec<Entry>,
    marshallers: Vec<Marshaller>,
    serial: i64,
    redirect: Option<Arc<dyn AnyComputable>>,
}

impl fmt::Debug for Inputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .entries
            .iter()
            .map(|e| match &e.value {
                InputValue::Undetermined(value) => format!("{}={}", e.name, value),
                _ => e.name.clone(),
            })
            .collect();
        let marshalled: Vec<&str> = self.marshallers.iter().map(|m| m.name.as_str()).collect();
        f.debug_struct("Inputs")
            .field("entries", &names)
            .field("marshallers", &marshalled)
            .field("serial", &self.serial)
            .field("redirect", &self.redirect.as_ref().map(|c| c.type_name()))
            .finish()
    }
}

impl Inputs {
    /// No inputs
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, name: impl Into<String>, value: InputValue) -> Self {
        self.entries.push(Entry {
            name: name.into(),
            value,
        });
        self
    }

    /// Any serializable value, digested through its canonical JSON form
    #[must_use]
    pub fn json<T: Serialize + ?Sized>(self, name: impl Into<String>, value: &T) -> Self {
        let value = match Digest::of_json(value) {
            Ok(digest) => InputValue::Digest(digest),
            Err(err) => InputValue::Invalid(err.to_string()),
        };
        self.push(name, value)
    }

    /// A string
    #[must_use]
    pub fn str(self, name: impl Into<String>, value: &str) -> Self {
        self.json(name, value)
    }

    /// A list of strings
    #[must_use]
    pub fn strs<S: AsRef<str>>(self, name: impl Into<String>, values: &[S]) -> Self {
        let values: Vec<&str> = values.iter().map(AsRef::as_ref).collect();
        self.json(name, &values)
    }

    /// A string map; order of the source map does not matter
    #[must_use]
    pub fn str_map<K, V, I>(self, name: impl Into<String>, values: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let sorted: BTreeMap<String, String> = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.json(name, &sorted)
    }

    /// Anything with a textual form
    #[must_use]
    pub fn stringer(self, name: impl Into<String>, value: &impl fmt::Display) -> Self {
        self.json(name, &value.to_string())
    }

    /// A boolean
    #[must_use]
    pub fn bool(self, name: impl Into<String>, value: bool) -> Self {
        self.json(name, &value)
    }

    /// Manual cache revision; bump it to invalidate previously stored outputs
    #[must_use]
    pub fn cache_rev(self, rev: u32) -> Self {
        self.json(CACHE_REV_INPUT, &rev)
    }

    /// A dependency; its value becomes available in
    /// [`Resolved`](crate::computable::Resolved) under `name`
    #[must_use]
    pub fn computable<C: Computable>(self, name: impl Into<String>, dep: Arc<C>) -> Self {
        self.push(name, InputValue::Computable(dep))
    }

    /// A type-erased dependency
    #[must_use]
    pub fn any_computable(self, name: impl Into<String>, dep: Arc<dyn AnyComputable>) -> Self {
        self.push(name, InputValue::Computable(dep))
    }

    /// An input that cannot be digested; the owning computable never gets a
    /// digest and is never shared or cached.
    #[must_use]
    pub fn indigestible(self, name: impl Into<String>, value: impl fmt::Debug) -> Self {
        self.push(name, InputValue::Undetermined(format!("{:?}", value)))
    }

    /// An input digested by writing bytes through a hash
    #[must_use]
    pub fn marshal<F>(mut self, name: impl Into<String>, marshal: F) -> Self
    where
        F: Fn(&mut dyn io::Write) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.marshallers.push(Marshaller {
            name: name.into(),
            marshal: Arc::new(marshal),
        });
        self
    }

    /// A value that knows its own digest
    #[must_use]
    pub fn digest(self, name: impl Into<String>, value: &impl Digestible) -> Self {
        let value = match value.compute_digest() {
            Ok(digest) => InputValue::Digest(Digest::of_bytes(digest.to_string().as_bytes())),
            Err(err) => InputValue::Invalid(format!("{:#}", err)),
        };
        self.push(name, value)
    }

    /// Version of the digest function; bump when the meaning of the inputs
    /// changes without the inputs themselves changing.
    #[must_use]
    pub fn version(mut self, serial: i64) -> Self {
        self.serial = serial;
        self
    }

    /// Resolve the owning computable as `target` instead: it joins whatever
    /// promise `target` has and never computes on its own.
    #[must_use]
    pub(crate) fn redirect_to(mut self, target: Arc<dyn AnyComputable>) -> Self {
        self.redirect = Some(target);
        self
    }

    pub(crate) fn redirect_target(&self) -> Option<Arc<dyn AnyComputable>> {
        self.redirect.clone()
    }

    /// Declared serial
    #[must_use]
    pub const fn serial(&self) -> i64 {
        self.serial
    }

    /// Whether any input is undetermined
    #[must_use]
    pub fn is_non_deterministic(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e.value, InputValue::Undetermined(_)))
    }

    /// Declared dependencies, in declaration order
    #[must_use]
    pub fn computables(&self) -> Vec<(String, Arc<dyn AnyComputable>)> {
        self.entries
            .iter()
            .filter_map(|e| match &e.value {
                InputValue::Computable(c) => Some((e.name.clone(), c.clone())),
                _ => None,
            })
            .collect()
    }

    /// Names of all entries, including marshalled ones
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|e| e.name.as_str())
            .chain(self.marshallers.iter().map(|m| m.name.as_str()))
            .collect()
    }
}

/// One entry of a computed input set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDigest {
    /// Entry name
    pub name: String,
    /// Entry digest, when known before computing
    pub digest: Option<String>,
}

/// Digests derived from an [`Inputs`]
#[derive(Clone)]
pub struct ComputedInputs {
    module_path: String,
    type_name: String,
    serial: i64,
    entries: Vec<InputDigest>,
    deps: IndexMap<String, Arc<dyn AnyComputable>>,
    non_deterministic: bool,
    /// Set only if every input is known ahead of computing
    pub digest: Option<Digest>,
    /// Set only after [`ComputedInputs::finalize`], if every resolved
    /// dependency produced a deterministic digest
    pub post_compute_digest: Option<Digest>,
}

impl fmt::Debug for ComputedInputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedInputs")
            .field("type_name", &self.type_name)
            .field("serial", &self.serial)
            .field("entries", &self.entries)
            .field("non_deterministic", &self.non_deterministic)
            .field("digest", &self.digest)
            .field("post_compute_digest", &self.post_compute_digest)
            .finish()
    }
}

impl ComputedInputs {
    /// Digest the inputs of `computable` without executing anything
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::Input`] if an input could not be digested
    pub fn of(computable: &dyn AnyComputable) -> ComputeResult<Self> {
        Self::compute(computable, computable.inputs(), true)
    }

    fn compute(computable: &dyn AnyComputable, inputs: Inputs, collect_deps: bool) -> ComputeResult<Self> {
        let (module_path, type_name) = split_type_name(computable.type_name());
        let mut res = Self {
            module_path: module_path.to_string(),
            type_name: type_name.to_string(),
            serial: inputs.serial,
            entries: Vec::new(),
            deps: IndexMap::new(),
            non_deterministic: false,
            digest: None,
            post_compute_digest: None,
        };

        let mut unset = 0usize;
        for entry in inputs.entries {
            let dep = match &entry.value {
                InputValue::Computable(dep) => Some(dep.clone()),
                _ => None,
            };
            if collect_deps {
                if let Some(dep) = &dep {
                    res.deps.insert(entry.name.clone(), dep.clone());
                }
            }

            match entry.value {
                InputValue::Undetermined(_) => {
                    res.non_deterministic = true;
                }
                InputValue::Invalid(reason) => {
                    return Err(ComputeError::Input {
                        name: entry.name,
                        reason,
                    });
                }
                InputValue::Digest(digest) => res.entries.push(InputDigest {
                    name: entry.name,
                    digest: Some(digest.to_string()),
                }),
                InputValue::Computable(dep) => {
                    if res.non_deterministic {
                        continue;
                    }

                    // A dependency that is never cached is never worth probing.
                    if !dep.output().can_cache() {
                        res.entries.push(InputDigest {
                            name: entry.name,
                            digest: None,
                        });
                        unset += 1;
                        continue;
                    }

                    let nested = Self::compute(dep.as_ref(), dep.inputs(), false).map_err(|err| {
                        ComputeError::dependency(entry.name.clone(), dep.type_name(), err)
                    })?;
                    let digest = nested.digest.map(|d| d.to_string());
                    if digest.is_none() {
                        unset += 1;
                    }
                    res.entries.push(InputDigest {
                        name: entry.name,
                        digest,
                    });
                }
            }
        }

        if res.non_deterministic {
            return Ok(res);
        }

        for marshaller in inputs.marshallers {
            let mut digester = Digester::new(DigestAlgorithm::Sha256);
            (marshaller.marshal)(&mut digester).map_err(|err| ComputeError::Input {
                name: marshaller.name.clone(),
                reason: format!("{:#}", err),
            })?;
            res.entries.push(InputDigest {
                name: marshaller.name,
                digest: Some(digester.finish().to_string()),
            });
        }

        res.entries.sort_by(|a, b| a.name.cmp(&b.name));

        if unset == 0 {
            let entries = res
                .entries
                .iter()
                .filter_map(|e| e.digest.as_deref().map(|d| (e.name.as_str(), d)));
            res.digest = Some(res.frame_digest(entries));
        }

        Ok(res)
    }

    fn frame_digest<'a>(&self, entries: impl Iterator<Item = (&'a str, &'a str)>) -> Digest {
        let mut frame = DigestFrame::new(&self.module_path, &self.type_name, self.serial);
        for (name, digest) in entries {
            frame.entry(name, digest);
        }
        frame.digest()
    }

    /// Compute the post-compute digest from resolved dependency outputs.
    ///
    /// Leaves it unset if any substituted dependency has no digest or is
    /// non-deterministic.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::Internal`] if an unset entry has no resolved value
    pub fn finalize(&mut self, resolved: &HashMap<String, Computed<AnyValue>>) -> ComputeResult<()> {
        if self.non_deterministic {
            return Ok(());
        }

        let mut complete = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            match &entry.digest {
                Some(digest) => complete.push((entry.name.clone(), digest.clone())),
                None => {
                    let value = resolved.get(&entry.name).ok_or_else(|| {
                        ComputeError::internal(format!("{}: computed value is missing", entry.name))
                    })?;
                    match &value.digest {
                        Some(digest) if !value.non_deterministic => {
                            complete.push((entry.name.clone(), digest.to_string()));
                        }
                        _ => return Ok(()),
                    }
                }
            }
        }

        let digest = self.frame_digest(complete.iter().map(|(n, d)| (n.as_str(), d.as_str())));
        self.post_compute_digest = Some(digest);
        Ok(())
    }

    /// Whether an undetermined input was declared
    #[must_use]
    pub const fn is_non_deterministic(&self) -> bool {
        self.non_deterministic
    }

    /// Sorted entries
    #[must_use]
    pub fn entries(&self) -> &[InputDigest] {
        &self.entries
    }

    /// Digests of the entries known before computing
    #[must_use]
    pub fn input_digests(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter_map(|e| e.digest.clone().map(|d| (e.name.clone(), d)))
            .collect()
    }

    /// Dependencies to resolve, in declaration order
    pub(crate) fn deps(&self) -> &IndexMap<String, Arc<dyn AnyComputable>> {
        &self.deps
    }

    /// Serial of the producing type
    #[must_use]
    pub const fn serial(&self) -> i64 {
        self.serial
    }

    /// Module of the producing type
    #[must_use]
    pub fn module_path(&self) -> &str {
        &self.module_path
    }

    /// Name of the producing type
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computable::{Output, Resolved, Scope};
    use crate::orchestrator::Context;
    use async_trait::async_trait;
    use proptest::prelude::*;

    struct Leaf {
        inputs: Inputs,
        output: Output,
    }

    impl Leaf {
        fn new(inputs: Inputs) -> Arc<Self> {
            Arc::new(Self {
                inputs,
                output: Output::new(),
            })
        }
    }

    #[async_trait]
    impl Computable for Leaf {
        type Value = String;

        fn inputs(&self) -> Inputs {
            self.inputs.clone()
        }

        fn output(&self) -> Output {
            self.output
        }

        fn scope(&self) -> Scope<'_> {
            Scope::Invocation
        }

        async fn compute(&self, _ctx: &Context, _deps: &Resolved) -> anyhow::Result<String> {
            Ok("leaf".to_string())
        }
    }

    fn digest_of(inputs: Inputs) -> ComputedInputs {
        ComputedInputs::of(Leaf::new(inputs).as_ref()).unwrap()
    }

    #[test]
    fn test_static_inputs_have_digest() {
        let computed = digest_of(Inputs::new().str("a", "x").bool("b", true));
        assert!(computed.digest.is_some());
        assert!(!computed.is_non_deterministic());
        assert_eq!(computed.entries().len(), 2);
        assert_eq!(computed.type_name(), "Leaf");
    }

    #[test]
    fn test_declaration_order_does_not_matter() {
        let a = digest_of(Inputs::new().str("a", "x").json("n", &5));
        let b = digest_of(Inputs::new().json("n", &5).str("a", "x"));
        assert_eq!(a.digest, b.digest);

        let c = digest_of(Inputs::new().json("n", &6).str("a", "x"));
        assert_ne!(a.digest, c.digest);
    }

    #[test]
    fn test_version_changes_digest() {
        let a = digest_of(Inputs::new().str("a", "x"));
        let b = digest_of(Inputs::new().str("a", "x").version(2));
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn test_str_map_is_order_independent() {
        let a = digest_of(Inputs::new().str_map("env", [("A", "1"), ("B", "2")]));
        let b = digest_of(Inputs::new().str_map("env", [("B", "2"), ("A", "1")]));
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn test_indigestible_has_no_digest() {
        let computed = digest_of(Inputs::new().str("a", "x").indigestible("now", "clock"));
        assert!(computed.is_non_deterministic());
        assert!(computed.digest.is_none());

        let mut computed = computed;
        computed.finalize(&HashMap::new()).unwrap();
        assert!(computed.post_compute_digest.is_none());
    }

    #[test]
    fn test_nested_deterministic_dependency() {
        let dep = Leaf::new(Inputs::new().json("n", &5));
        let computed = digest_of(Inputs::new().computable("dep", dep.clone()));
        assert!(computed.digest.is_some());
        assert_eq!(computed.deps().len(), 1);

        // The entry holds the dependency's input digest.
        let nested = ComputedInputs::of(dep.as_ref()).unwrap();
        assert_eq!(computed.entries()[0].digest, nested.digest.map(|d| d.to_string()));
    }

    #[test]
    fn test_nested_undetermined_dependency_defers_to_post_compute() {
        let dep = Leaf::new(Inputs::new().indigestible("x", 1));
        let mut computed = digest_of(Inputs::new().str("a", "x").computable("dep", dep));
        assert!(computed.digest.is_none());
        assert!(!computed.is_non_deterministic());

        let mut resolved = HashMap::new();
        resolved.insert(
            "dep".to_string(),
            Computed::erase(Computed::new("v".to_string(), Some(Digest::of_bytes(b"v")))),
        );
        computed.finalize(&resolved).unwrap();
        let first = computed.post_compute_digest.clone();
        assert!(first.is_some());

        resolved.insert(
            "dep".to_string(),
            Computed::erase(Computed::new("w".to_string(), Some(Digest::of_bytes(b"w")))),
        );
        computed.finalize(&resolved).unwrap();
        assert_ne!(computed.post_compute_digest, first);
    }

    #[test]
    fn test_finalize_without_output_digest() {
        let dep = Leaf::new(Inputs::new().indigestible("x", 1));
        let mut computed = digest_of(Inputs::new().computable("dep", dep));

        let mut resolved = HashMap::new();
        resolved.insert("dep".to_string(), Computed::erase(Computed::new("v".to_string(), None)));
        computed.finalize(&resolved).unwrap();
        assert!(computed.post_compute_digest.is_none());

        let mut nondet = Computed::new("v".to_string(), Some(Digest::of_bytes(b"v")));
        nondet.non_deterministic = true;
        resolved.insert("dep".to_string(), Computed::erase(nondet));
        computed.finalize(&resolved).unwrap();
        assert!(computed.post_compute_digest.is_none());

        assert!(computed.finalize(&HashMap::new()).is_err());
    }

    #[test]
    fn test_uncacheable_dependency_is_unset() {
        let dep = Arc::new(Leaf {
            inputs: Inputs::new().json("n", &5),
            output: Output::new().dont_cache(),
        });
        let computed = digest_of(Inputs::new().computable("dep", dep));
        assert!(computed.digest.is_none());
    }

    #[test]
    fn test_marshal_entries() {
        let a = digest_of(Inputs::new().marshal("blob", |w| {
            w.write_all(b"contents")?;
            Ok(())
        }));
        let b = digest_of(Inputs::new().marshal("blob", |w| {
            w.write_all(b"other")?;
            Ok(())
        }));
        assert!(a.digest.is_some());
        assert_ne!(a.digest, b.digest);

        let failing = ComputedInputs::of(
            Leaf::new(Inputs::new().marshal("bad", |_| anyhow::bail!("nope"))).as_ref(),
        );
        assert!(matches!(failing, Err(ComputeError::Input { .. })));
    }

    #[test]
    fn test_input_digests_and_names() {
        let computed = digest_of(Inputs::new().str("b", "1").str("a", "2"));
        let digests = computed.input_digests();
        assert_eq!(digests.keys().collect::<Vec<_>>(), vec!["a", "b"]);

        let inputs = Inputs::new().str("x", "1").marshal("m", |_| Ok(()));
        assert_eq!(inputs.names(), vec!["x", "m"]);
    }

    proptest! {
        #[test]
        fn prop_str_map_ignores_insertion_order(
            mut pairs in proptest::collection::btree_map("[a-z]{1,6}", "[ -~]{0,12}", 0..8)
                .prop_map(|m| m.into_iter().collect::<Vec<_>>())
        ) {
            let forward = digest_of(Inputs::new().str_map("env", pairs.clone())).digest;
            pairs.reverse();
            let backward = digest_of(Inputs::new().str_map("env", pairs)).digest;
            prop_assert_eq!(forward, backward);
        }
    }
}
