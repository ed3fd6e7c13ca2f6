//! View-model registry for a single connection

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex as AsyncMutex, OnceCell};
use tracing::{debug, trace};

use vmhub_core::{
    BuildContext, ChangeNotifier, ChangeSet, FilterContext, FilterOutcome, FilterSet, HubError,
    Identity, Response, Result, ViewModel, ViewModelTypes, VM_ARG_KEY,
};

/// Receives every push a registry produces. Must not block.
pub type PushCallback = Arc<dyn Fn(Response) + Send + Sync>;

/// A live instance; the async mutex serialises access in arrival order
type Instance = Arc<AsyncMutex<Box<dyn ViewModel>>>;

/// Filled once construction succeeds; concurrent requests for one id share it
type Slot = Arc<OnceCell<Instance>>;

/// Owns the live view models of one connection
pub struct ViewModelRegistry {
    connection_id: String,
    types: ViewModelTypes,
    filters: FilterSet,
    slots: Mutex<HashMap<String, Slot>>,
    on_push: PushCallback,
    notify_tx: mpsc::UnboundedSender<String>,
}

impl fmt::Debug for ViewModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewModelRegistry")
            .field("connection_id", &self.connection_id)
            .field("vm_ids", &self.vm_ids())
            .field("filters", &self.filters)
            .finish()
    }
}

impl ViewModelRegistry {
    /// Create a registry and start its change pump.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        connection_id: impl Into<String>,
        types: ViewModelTypes,
        filters: FilterSet,
        on_push: PushCallback,
    ) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            connection_id: connection_id.into(),
            types,
            filters,
            slots: Mutex::new(HashMap::new()),
            on_push,
            notify_tx,
        });
        tokio::spawn(pump_changes(Arc::downgrade(&registry), notify_rx));
        registry
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Ids of the constructed instances, sorted
    pub fn vm_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, vm_id: &str) -> bool {
        self.slots
            .lock()
            .get(vm_id)
            .is_some_and(|slot| slot.initialized())
    }

    pub fn len(&self) -> usize {
        self.vm_ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve (constructing if needed) the named view model, run the
    /// pre-request filters and push its full state.
    pub async fn request_vm(
        &self,
        identity: &Identity,
        vm_id: &str,
        arg: Option<Value>,
    ) -> Result<()> {
        let slot = self.slot(vm_id);
        let mut constructed = false;
        let flag = &mut constructed;
        let build_arg = arg.clone();

        let initialised = slot
            .get_or_try_init(move || async move {
                *flag = true;
                let ctx = BuildContext {
                    connection_id: self.connection_id.clone(),
                    vm_id: vm_id.to_string(),
                    arg: build_arg,
                    identity: identity.clone(),
                    notifier: ChangeNotifier::new(vm_id, self.notify_tx.clone()),
                };
                let vm = self.types.build(ctx).await?;
                Ok::<Instance, HubError>(Arc::new(AsyncMutex::new(vm)))
            })
            .await;

        let instance = match initialised {
            Ok(instance) => Arc::clone(instance),
            Err(err) => {
                self.forget_if_empty(vm_id, &slot);
                return Err(err);
            }
        };
        if constructed {
            debug!(connection_id = %self.connection_id, vm_id, "Constructed view model");
        }

        let mut vm = instance.lock().await;
        if !self.is_current(vm_id, &slot) {
            // disposed while it was being built
            if constructed {
                vm.on_dispose();
            }
            return Ok(());
        }

        let ctx = FilterContext {
            connection_id: &self.connection_id,
            vm_id,
            identity,
        };
        let mut arg = arg;
        let outcome = self.filters.before_request(&ctx, &**vm, &mut arg).await;
        match outcome {
            Ok(FilterOutcome::Continue) => {}
            Ok(FilterOutcome::Veto) => {
                if constructed {
                    self.forget(vm_id, &slot);
                    vm.on_dispose();
                }
                return Ok(());
            }
            Err(err) => {
                if constructed {
                    self.forget(vm_id, &slot);
                    vm.on_dispose();
                }
                return Err(err);
            }
        }

        let initial = arg
            .as_ref()
            .and_then(|arg| arg.get(VM_ARG_KEY))
            .cloned();
        if let Some(Value::Object(initial)) = initial {
            if let Err(err) = apply_changes(&mut **vm, vm_id, initial).await {
                if constructed {
                    self.forget(vm_id, &slot);
                    vm.on_dispose();
                } else {
                    let delta = vm.take_changes();
                    drop(vm);
                    self.push_delta(vm_id, delta);
                }
                return Err(err);
            }
        }

        // the full state supersedes anything recorded so far
        let _ = vm.take_changes();
        let state = vm.state();
        drop(vm);

        self.push(Response::from_value(&self.connection_id, vm_id, &state));
        Ok(())
    }

    /// Apply `changes` to an existing view model and push the delta, if any
    pub async fn update_vm(
        &self,
        identity: &Identity,
        vm_id: &str,
        changes: ChangeSet,
    ) -> Result<()> {
        let instance = self.instance(vm_id).await?;
        let mut vm = instance.lock().await;

        let ctx = FilterContext {
            connection_id: &self.connection_id,
            vm_id,
            identity,
        };
        let mut changes = changes;
        if self.filters.before_update(&ctx, &**vm, &mut changes).await? == FilterOutcome::Veto {
            return Ok(());
        }

        // pairs applied before a failure stay applied and are still pushed
        let applied = apply_changes(&mut **vm, vm_id, changes).await;
        let delta = vm.take_changes();
        drop(vm);

        self.push_delta(vm_id, delta);
        applied
    }

    /// Release a view model; unknown ids are ignored.
    ///
    /// Returns whether an instance was disposed.
    pub async fn dispose_vm(&self, vm_id: &str) -> bool {
        let slot = self.slots.lock().remove(vm_id);
        let Some(instance) = slot.and_then(|slot| slot.get().cloned()) else {
            debug!(connection_id = %self.connection_id, vm_id, "Dispose of unknown view model ignored");
            return false;
        };
        instance.lock().await.on_dispose();
        debug!(connection_id = %self.connection_id, vm_id, "Disposed view model");
        true
    }

    /// Release every view model, waiting for in-flight operations on each
    pub async fn dispose_all(&self) -> usize {
        let slots: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        let mut count = 0;
        for slot in slots {
            if let Some(instance) = slot.get() {
                instance.lock().await.on_dispose();
                count += 1;
            }
        }
        count
    }

    fn slot(&self, vm_id: &str) -> Slot {
        Arc::clone(self.slots.lock().entry(vm_id.to_string()).or_default())
    }

    async fn instance(&self, vm_id: &str) -> Result<Instance> {
        let slot = self
            .slots
            .lock()
            .get(vm_id)
            .cloned()
            .ok_or_else(|| HubError::not_found(vm_id))?;

        // waits for a construction already in progress
        let instance = slot
            .get_or_try_init(|| async { Err(HubError::not_found(vm_id)) })
            .await?;
        Ok(Arc::clone(instance))
    }

    fn is_current(&self, vm_id: &str, slot: &Slot) -> bool {
        self.slots
            .lock()
            .get(vm_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn forget(&self, vm_id: &str, slot: &Slot) {
        let mut slots = self.slots.lock();
        if slots
            .get(vm_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            slots.remove(vm_id);
        }
    }

    fn forget_if_empty(&self, vm_id: &str, slot: &Slot) {
        if !slot.initialized() {
            self.forget(vm_id, slot);
        }
    }

    async fn flush_changes(&self, vm_id: &str) {
        let instance = self
            .slots
            .lock()
            .get(vm_id)
            .and_then(|slot| slot.get().cloned());
        let Some(instance) = instance else {
            return;
        };

        let delta = instance.lock().await.take_changes();
        self.push_delta(vm_id, delta);
    }

    fn push_delta(&self, vm_id: &str, delta: Option<ChangeSet>) {
        match delta.filter(|delta| !delta.is_empty()) {
            Some(delta) => self.push(Response::from_value(
                &self.connection_id,
                vm_id,
                &Value::Object(delta),
            )),
            None => trace!(vm_id, "No observable change"),
        }
    }

    fn push(&self, response: Response) {
        trace!(connection_id = %response.connection_id, vm_id = %response.vm_id, "Push");
        (self.on_push)(response);
    }
}

/// Apply pairs in order, stopping at the first failure
async fn apply_changes(vm: &mut dyn ViewModel, vm_id: &str, changes: ChangeSet) -> Result<()> {
    for (path, value) in changes {
        vm.apply(&path, value)
            .await
            .map_err(|e| HubError::update(vm_id, path.as_str(), e.to_string()))?;
    }
    Ok(())
}

/// Turns [`ChangeNotifier::notify`] calls into delta pushes
async fn pump_changes(registry: Weak<ViewModelRegistry>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(vm_id) = rx.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.flush_changes(&vm_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};
    use vmhub_core::{BoxError, ViewModelFilter};

    struct Counter {
        count: i64,
        changed: bool,
        disposed: Arc<AtomicBool>,
        notifier: ChangeNotifier,
    }

    #[async_trait]
    impl ViewModel for Counter {
        fn state(&self) -> Value {
            json!({"count": self.count})
        }

        async fn apply(&mut self, path: &str, value: Value) -> std::result::Result<(), BoxError> {
            match path {
                "count" => {
                    let count = value.as_i64().ok_or("count must be an integer")?;
                    if count != self.count {
                        self.count = count;
                        self.changed = true;
                    }
                    Ok(())
                }
                other => Err(format!("unknown property '{}'", other).into()),
            }
        }

        fn take_changes(&mut self) -> Option<ChangeSet> {
            if !std::mem::take(&mut self.changed) {
                return None;
            }
            let mut delta = ChangeSet::new();
            delta.insert("count".to_string(), json!(self.count));
            Some(delta)
        }

        fn on_dispose(&mut self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    struct Fixture {
        registry: Arc<ViewModelRegistry>,
        pushes: mpsc::UnboundedReceiver<Response>,
        constructed: Arc<AtomicUsize>,
        disposed: Arc<AtomicBool>,
        notifiers: Arc<Mutex<Vec<ChangeNotifier>>>,
    }

    fn fixture(filters: FilterSet) -> Fixture {
        let constructed = Arc::new(AtomicUsize::new(0));
        let disposed = Arc::new(AtomicBool::new(false));
        let notifiers = Arc::new(Mutex::new(Vec::new()));

        let types = ViewModelTypes::new();
        {
            let constructed = Arc::clone(&constructed);
            let disposed = Arc::clone(&disposed);
            let notifiers = Arc::clone(&notifiers);
            types.register_fn("Counter", move |ctx: BuildContext| {
                constructed.fetch_add(1, Ordering::SeqCst);
                notifiers.lock().push(ctx.notifier.clone());
                let start = ctx
                    .arg
                    .as_ref()
                    .and_then(|arg| arg.get("start"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                Ok(Box::new(Counter {
                    count: start,
                    changed: false,
                    disposed: Arc::clone(&disposed),
                    notifier: ctx.notifier,
                }) as Box<dyn ViewModel>)
            });
        }
        types.register_fn("Broken", |_| Err("constructor exploded".into()));

        let (tx, pushes) = mpsc::unbounded_channel();
        let on_push: PushCallback = Arc::new(move |response| {
            let _ = tx.send(response);
        });

        Fixture {
            registry: ViewModelRegistry::new("conn-1", types, filters, on_push),
            pushes,
            constructed,
            disposed,
            notifiers,
        }
    }

    fn changes(value: Value) -> ChangeSet {
        match value {
            Value::Object(map) => map,
            _ => ChangeSet::new(),
        }
    }

    #[tokio::test]
    async fn test_request_pushes_full_state() {
        let mut fx = fixture(FilterSet::default());
        let identity = Identity::anonymous();

        fx.registry.request_vm(&identity, "Counter", None).await.unwrap();

        let push = fx.pushes.recv().await.unwrap();
        assert_eq!(push.connection_id, "conn-1");
        assert_eq!(push.vm_id, "Counter");
        assert_eq!(push.data_value().unwrap(), json!({"count": 0}));
        assert_eq!(fx.registry.vm_ids(), vec!["Counter".to_string()]);
    }

    #[tokio::test]
    async fn test_repeat_request_reuses_instance() {
        let mut fx = fixture(FilterSet::default());
        let identity = Identity::anonymous();

        fx.registry.request_vm(&identity, "Counter", None).await.unwrap();
        fx.registry.request_vm(&identity, "Counter", None).await.unwrap();

        assert_eq!(fx.constructed.load(Ordering::SeqCst), 1);
        assert!(fx.pushes.recv().await.is_some());
        assert!(fx.pushes.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_request_dispose_request_constructs_new_instance() {
        let fx = fixture(FilterSet::default());
        let identity = Identity::anonymous();

        fx.registry.request_vm(&identity, "Counter", None).await.unwrap();
        fx.registry
            .update_vm(&identity, "Counter", changes(json!({"count": 7})))
            .await
            .unwrap();
        assert!(fx.registry.dispose_vm("Counter").await);
        assert!(fx.disposed.load(Ordering::SeqCst));
        assert!(fx.registry.is_empty());

        fx.registry.request_vm(&identity, "Counter", None).await.unwrap();
        assert_eq!(fx.constructed.load(Ordering::SeqCst), 2);
        assert_eq!(fx.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_is_not_found() {
        let fx = fixture(FilterSet::default());
        let identity = Identity::anonymous();

        let err = fx
            .registry
            .update_vm(&identity, "Counter", changes(json!({"count": 1})))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "VMNotFoundError");
        assert_eq!(fx.constructed.load(Ordering::SeqCst), 0);
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_update_pushes_delta_only_when_changed() {
        let mut fx = fixture(FilterSet::default());
        let identity = Identity::anonymous();
        fx.registry.request_vm(&identity, "Counter", None).await.unwrap();
        fx.pushes.recv().await.unwrap();

        fx.registry
            .update_vm(&identity, "Counter", changes(json!({"count": 5})))
            .await
            .unwrap();
        let push = fx.pushes.recv().await.unwrap();
        assert_eq!(push.data_value().unwrap(), json!({"count": 5}));

        fx.registry
            .update_vm(&identity, "Counter", changes(json!({"count": 5})))
            .await
            .unwrap();
        assert!(fx.pushes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_bad_path_is_update_error() {
        let fx = fixture(FilterSet::default());
        let identity = Identity::anonymous();
        fx.registry.request_vm(&identity, "Counter", None).await.unwrap();

        let err = fx
            .registry
            .update_vm(&identity, "Counter", changes(json!({"missing": 1})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "VMUpdateError");
    }

    #[tokio::test]
    async fn test_unknown_type_and_broken_constructor() {
        let fx = fixture(FilterSet::default());
        let identity = Identity::anonymous();

        let err = fx.registry.request_vm(&identity, "Nope", None).await.unwrap_err();
        assert_eq!(err.kind(), "VMNotFoundError");

        let err = fx.registry.request_vm(&identity, "Broken", None).await.unwrap_err();
        assert_eq!(err.kind(), "VMInstantiationError");
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_requests_for_different_ids() {
        let mut fx = fixture(FilterSet::default());
        let identity = Identity::anonymous();

        let (a, b) = tokio::join!(
            fx.registry.request_vm(&identity, "Counter$a", None),
            fx.registry.request_vm(&identity, "Counter$b", None),
        );
        a.unwrap();
        b.unwrap();

        let mut ids = vec![
            fx.pushes.recv().await.unwrap().vm_id,
            fx.pushes.recv().await.unwrap().vm_id,
        ];
        ids.sort();
        assert_eq!(ids, vec!["Counter$a".to_string(), "Counter$b".to_string()]);
        assert!(fx.pushes.try_recv().is_err());
        assert_eq!(fx.constructed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_for_same_id_construct_once() {
        let fx = fixture(FilterSet::default());
        let identity = Identity::anonymous();

        let (a, b) = tokio::join!(
            fx.registry.request_vm(&identity, "Counter", None),
            fx.registry.request_vm(&identity, "Counter", None),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(fx.constructed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_vm_arg_initial_values() {
        let mut fx = fixture(FilterSet::default());
        let identity = Identity::anonymous();

        fx.registry
            .request_vm(&identity, "Counter", Some(json!({"$vmArg": {"count": 3}})))
            .await
            .unwrap();
        let push = fx.pushes.recv().await.unwrap();
        assert_eq!(push.data_value().unwrap(), json!({"count": 3}));

        // construction may consult the argument too
        fx.registry
            .request_vm(&identity, "Counter$x", Some(json!({"start": 9})))
            .await
            .unwrap();
        let push = fx.pushes.recv().await.unwrap();
        assert_eq!(push.data_value().unwrap(), json!({"count": 9}));
    }

    #[tokio::test]
    async fn test_failed_vm_arg_discards_new_instance() {
        let mut fx = fixture(FilterSet::default());
        let identity = Identity::anonymous();

        let arg = json!({"$vmArg": {"count": 7, "bad": 1}});
        let err = assert_err!(fx.registry.request_vm(&identity, "Counter", Some(arg)).await);
        assert_eq!(err.kind(), "VMUpdateError");
        assert!(fx.registry.is_empty());
        assert!(fx.disposed.load(Ordering::SeqCst));
        assert!(fx.pushes.try_recv().is_err());

        // the next request starts from a clean instance
        assert_ok!(fx.registry.request_vm(&identity, "Counter", None).await);
        assert_eq!(fx.constructed.load(Ordering::SeqCst), 2);
        let push = fx.pushes.recv().await.unwrap();
        assert_eq!(push.data_value().unwrap(), json!({"count": 0}));

        assert_ok!(
            fx.registry
                .update_vm(&identity, "Counter", changes(json!({"count": 0})))
                .await
        );
        assert!(fx.pushes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_vm_arg_on_existing_instance_pushes_applied_values() {
        let mut fx = fixture(FilterSet::default());
        let identity = Identity::anonymous();
        assert_ok!(fx.registry.request_vm(&identity, "Counter", None).await);
        fx.pushes.recv().await.unwrap();

        let arg = json!({"$vmArg": {"count": 4, "bad": 1}});
        let err = assert_err!(fx.registry.request_vm(&identity, "Counter", Some(arg)).await);
        assert_eq!(err.kind(), "VMUpdateError");
        assert!(!fx.disposed.load(Ordering::SeqCst));
        assert_eq!(fx.registry.vm_ids(), vec!["Counter".to_string()]);

        let push = fx.pushes.recv().await.unwrap();
        assert_eq!(push.data_value().unwrap(), json!({"count": 4}));
    }

    #[tokio::test]
    async fn test_partial_update_failure_pushes_applied_pairs() {
        let mut fx = fixture(FilterSet::default());
        let identity = Identity::anonymous();
        assert_ok!(fx.registry.request_vm(&identity, "Counter", None).await);
        fx.pushes.recv().await.unwrap();

        let err = assert_err!(
            fx.registry
                .update_vm(&identity, "Counter", changes(json!({"count": 9, "bad": 1})))
                .await
        );
        assert_eq!(err.kind(), "VMUpdateError");
        let push = fx.pushes.recv().await.unwrap();
        assert_eq!(push.data_value().unwrap(), json!({"count": 9}));

        // nothing left over for the next update to carry
        assert_ok!(
            fx.registry
                .update_vm(&identity, "Counter", changes(json!({"count": 9})))
                .await
        );
        assert!(fx.pushes.try_recv().is_err());
    }

    struct VetoAll;

    #[async_trait]
    impl ViewModelFilter for VetoAll {
        fn name(&self) -> &str {
            "veto-all"
        }

        async fn before_request(
            &self,
            _ctx: &FilterContext<'_>,
            _vm: &dyn ViewModel,
            _arg: &mut Option<Value>,
        ) -> Result<FilterOutcome> {
            Ok(FilterOutcome::Veto)
        }
    }

    #[tokio::test]
    async fn test_vetoed_request_discards_instance() {
        let mut fx = fixture(FilterSet::new(vec![Arc::new(VetoAll)]));
        let identity = Identity::anonymous();

        fx.registry.request_vm(&identity, "Counter", None).await.unwrap();

        assert_eq!(fx.constructed.load(Ordering::SeqCst), 1);
        assert!(fx.disposed.load(Ordering::SeqCst));
        assert!(fx.registry.is_empty());
        assert!(fx.pushes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_out_of_band_change_is_pushed() {
        let mut fx = fixture(FilterSet::default());
        let identity = Identity::anonymous();
        fx.registry.request_vm(&identity, "Counter", None).await.unwrap();
        fx.pushes.recv().await.unwrap();

        let instance = fx.registry.instance("Counter").await.unwrap();
        {
            let mut vm = instance.lock().await;
            vm.apply("count", json!(42)).await.unwrap();
        }
        let notifier = fx.notifiers.lock()[0].clone();
        assert!(notifier.notify());

        let push = tokio::time::timeout(Duration::from_secs(1), fx.pushes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(push.data_value().unwrap(), json!({"count": 42}));
    }

    #[tokio::test]
    async fn test_dispose_unknown_is_noop() {
        let fx = fixture(FilterSet::default());
        assert!(!fx.registry.dispose_vm("Counter").await);
        assert!(!fx.registry.dispose_vm("Counter").await);
    }

    #[tokio::test]
    async fn test_dispose_all_releases_instances() {
        let fx = fixture(FilterSet::default());
        let identity = Identity::anonymous();
        fx.registry.request_vm(&identity, "Counter$a", None).await.unwrap();
        fx.registry.request_vm(&identity, "Counter$b", None).await.unwrap();

        assert_eq!(fx.registry.dispose_all().await, 2);
        assert!(fx.registry.is_empty());
        assert!(fx.disposed.load(Ordering::SeqCst));
    }
}
