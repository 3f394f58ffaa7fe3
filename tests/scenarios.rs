//! End-to-end scenarios exercising the outer scheduler, inner-parallelism
//! slicing, deferred mutation, entity reclamation, refresh rematching, and
//! producer/consumer system outputs together, the way a single system body
//! would combine them in practice.

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use statecs::{
    DataProxy, EngineBuilder, EntityId, InnerParallelism, RefreshHandlers, StorageStrategy,
    SystemBuilder, SystemId, SystemLogic,
};

struct Marker;
struct AMarker;
struct BMarker;
struct KMarker;

struct NoopLogic;
impl SystemLogic for NoopLogic {
    fn run(&self, _proxy: &mut DataProxy) {}
    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct SetCounter(Arc<AtomicU32>);
impl SystemLogic for SetCounter {
    fn run(&self, _proxy: &mut DataProxy) {
        self.0.store(1, Ordering::SeqCst);
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct CheckAndFlag {
    counter: Arc<AtomicU32>,
    flag: Arc<AtomicU32>,
    bit: u32,
}
impl SystemLogic for CheckAndFlag {
    fn run(&self, _proxy: &mut DataProxy) {
        assert_eq!(self.counter.load(Ordering::SeqCst), 1);
        self.flag.fetch_or(self.bit, Ordering::SeqCst);
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn scenario_1_dag_ordering() {
    let counter = Arc::new(AtomicU32::new(0));
    let flag = Arc::new(AtomicU32::new(0));

    let mut builder = EngineBuilder::new();
    let a = builder.add_system(SystemBuilder::new(SetCounter(counter.clone())));
    builder.add_system(
        SystemBuilder::new(CheckAndFlag { counter: counter.clone(), flag: flag.clone(), bit: 0b01 })
            .depends_on(a),
    );
    builder.add_system(
        SystemBuilder::new(CheckAndFlag { counter: counter.clone(), flag: flag.clone(), bit: 0b10 })
            .depends_on(a),
    );
    let mut engine = builder.build().unwrap();

    engine
        .step(|proxy| proxy.execute_systems_from(&[a]), RefreshHandlers::new())
        .unwrap();

    assert_eq!(flag.load(Ordering::SeqCst), 0b11);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

struct RecordSlice(Arc<Mutex<Vec<Vec<EntityId>>>>);
impl SystemLogic for RecordSlice {
    fn run(&self, proxy: &mut DataProxy) {
        let mut ids = Vec::new();
        proxy.for_entities(|id| ids.push(id));
        self.0.lock().unwrap().push(ids);
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn scenario_2_inner_parallelism_slicing() {
    let mut builder = EngineBuilder::new();
    builder.component::<Marker>(StorageStrategy::Dense);
    let slices = Arc::new(Mutex::new(Vec::new()));
    let sys = builder.add_system(
        SystemBuilder::new(RecordSlice(slices.clone()))
            .reads::<Marker>()
            .inner_parallelism(InnerParallelism::SplitN(4)),
    );
    let mut engine = builder.build().unwrap();

    let mut created = Vec::new();
    engine
        .step(
            |proxy| {
                for _ in 0..10 {
                    let id = proxy.create_entity()?;
                    proxy.add_component(id, Marker)?;
                    created.push(id);
                }
                Ok(())
            },
            RefreshHandlers::new(),
        )
        .unwrap();

    engine
        .step(|proxy| proxy.execute_systems_from(&[sys]), RefreshHandlers::new())
        .unwrap();

    let slices = slices.lock().unwrap();
    let mut sizes: Vec<usize> = slices.iter().map(|s| s.len()).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![2, 2, 3, 3]);

    let mut all: Vec<EntityId> = slices.iter().flatten().copied().collect();
    all.sort_unstable();
    let mut expected = created.clone();
    expected.sort_unstable();
    assert_eq!(all, expected);
}

struct Deferrer;
impl SystemLogic for Deferrer {
    fn run(&self, proxy: &mut DataProxy) {
        let mut ids = Vec::new();
        proxy.for_entities(|id| ids.push(id));
        for _ in ids {
            proxy.defer(move |step| {
                if let Ok(id) = step.create_entity() {
                    let _ = step.add_component(id, KMarker);
                }
            });
        }
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn scenario_3_deferred_creation() {
    let mut builder = EngineBuilder::new();
    builder.component::<KMarker>(StorageStrategy::Dense);
    let deferrer = builder.add_system(SystemBuilder::new(Deferrer));
    let k_sys = builder.add_system(SystemBuilder::new(NoopLogic).reads::<KMarker>());
    let mut engine = builder.build().unwrap();

    engine
        .step(
            |proxy| {
                for _ in 0..5 {
                    proxy.create_entity()?;
                }
                Ok(())
            },
            RefreshHandlers::new(),
        )
        .unwrap();

    let subscribed = Arc::new(Mutex::new(Vec::new()));
    let recorded = subscribed.clone();
    let mut handlers = RefreshHandlers::new();
    handlers.on_subscribe = Some(Box::new(move |sid, id| recorded.lock().unwrap().push((sid, id))));

    engine
        .step(|proxy| proxy.execute_systems_from(&[deferrer]), handlers)
        .unwrap();

    let subs = subscribed.lock().unwrap();
    let k_subs: Vec<EntityId> = subs
        .iter()
        .filter(|&&(sid, _)| sid == k_sys)
        .map(|&(_, id)| id)
        .collect();
    assert_eq!(k_subs.len(), 5);
    assert_eq!(engine.alive_count(), 10);
}

#[test]
fn scenario_4_kill_and_handle_invalidation() {
    let mut builder = EngineBuilder::new();
    builder.component::<KMarker>(StorageStrategy::Dense);
    let mut engine = builder.build().unwrap();

    let mut handle_opt = None;
    let mut entity_opt = None;
    engine
        .step(
            |proxy| {
                let e = proxy.create_entity()?;
                proxy.add_component(e, KMarker)?;
                handle_opt = Some(proxy.create_handle(e));
                entity_opt = Some(e);
                Ok(())
            },
            RefreshHandlers::new(),
        )
        .unwrap();
    let handle = handle_opt.unwrap();
    let e = entity_opt.unwrap();

    engine
        .step(
            |proxy| {
                proxy.kill_entity(e);
                Ok(())
            },
            RefreshHandlers::new(),
        )
        .unwrap();

    let mut still_valid = true;
    engine
        .step(
            |proxy| {
                still_valid = proxy.valid_handle(handle);
                Ok(())
            },
            RefreshHandlers::new(),
        )
        .unwrap();
    assert!(!still_valid);

    let mut e2_opt = None;
    let mut old_handle_valid_after_reuse = true;
    engine
        .step(
            |proxy| {
                e2_opt = Some(proxy.create_entity()?);
                old_handle_valid_after_reuse = proxy.valid_handle(handle);
                Ok(())
            },
            RefreshHandlers::new(),
        )
        .unwrap();
    let e2 = e2_opt.unwrap();

    if e2 == e {
        assert!(!old_handle_valid_after_reuse);
    }
}

struct DeferAddB;
impl SystemLogic for DeferAddB {
    fn run(&self, proxy: &mut DataProxy) {
        let mut ids = Vec::new();
        proxy.for_entities(|id| ids.push(id));
        for id in ids {
            proxy.defer(move |step| {
                let _ = step.add_component(id, BMarker);
            });
        }
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn scenario_5_refresh_rematch_after_add() {
    let mut builder = EngineBuilder::new();
    builder.component::<AMarker>(StorageStrategy::Dense);
    builder.component::<BMarker>(StorageStrategy::Dense);
    let deferrer = builder.add_system(SystemBuilder::new(DeferAddB));
    let consumer = builder.add_system(SystemBuilder::new(NoopLogic).reads::<AMarker>().reads::<BMarker>());
    let mut engine = builder.build().unwrap();

    let mut e_opt = None;
    engine
        .step(
            |proxy| {
                let e = proxy.create_entity()?;
                proxy.add_component(e, AMarker)?;
                e_opt = Some(e);
                Ok(())
            },
            RefreshHandlers::new(),
        )
        .unwrap();
    let e = e_opt.unwrap();

    let subscribe_count = Arc::new(AtomicU32::new(0));
    let sc = subscribe_count.clone();
    let mut handlers = RefreshHandlers::new();
    handlers.on_subscribe = Some(Box::new(move |sid, id| {
        if sid == consumer && id == e {
            sc.fetch_add(1, Ordering::SeqCst);
        }
    }));

    engine
        .step(|proxy| proxy.execute_systems_from(&[deferrer]), handlers)
        .unwrap();

    assert_eq!(subscribe_count.load(Ordering::SeqCst), 1);
}

struct Producer(Arc<AtomicU32>);
impl SystemLogic for Producer {
    fn run(&self, proxy: &mut DataProxy) {
        let n = proxy.entity_count() as u32;
        let out = proxy.output::<Vec<(u32, u32)>>();
        for i in 0..n {
            out.push((i, i * 2));
        }
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn new_output(&self) -> Box<dyn Any + Send> {
        Box::new(Vec::<(u32, u32)>::new())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Consumer {
    producer: SystemId,
    total: Arc<AtomicU32>,
}
impl SystemLogic for Consumer {
    fn run(&self, proxy: &mut DataProxy) {
        let mut sum = 0u32;
        proxy.for_previous_outputs::<Vec<(u32, u32)>>(self.producer, |pairs| {
            sum += pairs.len() as u32;
        });
        self.total.fetch_add(sum, Ordering::SeqCst);
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn scenario_6_producer_consumer_outputs() {
    let mut builder = EngineBuilder::new();
    builder.component::<Marker>(StorageStrategy::Dense);
    let produced_runs = Arc::new(AtomicU32::new(0));
    let p = builder.add_system(
        SystemBuilder::new(Producer(produced_runs.clone()))
            .reads::<Marker>()
            .inner_parallelism(InnerParallelism::SplitN(3)),
    );
    let total = Arc::new(AtomicU32::new(0));
    builder.add_system(
        SystemBuilder::new(Consumer { producer: p, total: total.clone() }).depends_on(p),
    );
    let mut engine = builder.build().unwrap();

    let mut created = 0u32;
    engine
        .step(
            |proxy| {
                for _ in 0..9 {
                    let id = proxy.create_entity()?;
                    proxy.add_component(id, Marker)?;
                    created += 1;
                }
                Ok(())
            },
            RefreshHandlers::new(),
        )
        .unwrap();

    engine
        .step(|proxy| proxy.execute_systems_from(&[p]), RefreshHandlers::new())
        .unwrap();

    assert!(produced_runs.load(Ordering::SeqCst) >= 1);
    assert_eq!(total.load(Ordering::SeqCst), created);
}
