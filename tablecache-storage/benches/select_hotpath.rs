use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use tablecache_core::{
    CacheConfig, CacheResult, ConnectionId, EvictionStrategy, ObjectId, ScopeKey, Serial, Session,
    TypeDescriptor,
};
use tablecache_storage::{
    CacheSwitch, CachedObject, IndexSpec, MockObjectStore, ObjectCache, Restampable,
};

#[derive(Debug, Clone)]
struct Item {
    id: ObjectId,
    sku: String,
    serial: Serial,
}

impl CachedObject for Item {
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn table_serial(&self) -> Serial {
        self.serial
    }

    fn scope(&self) -> ScopeKey {
        ScopeKey::global()
    }
}

impl Restampable for Item {
    fn restamp(&mut self, serial: Serial) {
        self.serial = serial;
    }
}

struct BySku(Arc<MockObjectStore<Item>>);

impl IndexSpec<Item> for BySku {
    type Key = String;

    fn name(&self) -> &str {
        "sku"
    }

    fn extract(&self, object: &Item) -> String {
        object.sku.clone()
    }

    fn load(&self, _: &Session, _: &ScopeKey, key: &String) -> CacheResult<Option<Item>> {
        self.0.find(|item| &item.sku == key)
    }
}

type ItemCache = ObjectCache<Item, MockObjectStore<Item>>;

fn bench_cache(rows: ObjectId, config: CacheConfig) -> (Arc<MockObjectStore<Item>>, ItemCache) {
    let store = Arc::new(MockObjectStore::new());
    for id in 1..=rows {
        store
            .save(Item {
                id,
                sku: format!("sku-{id:05}"),
                serial: 0,
            })
            .expect("seed store");
    }
    let cache = ObjectCache::new(
        TypeDescriptor::new("item", "items"),
        Arc::clone(&store),
        false,
        &config,
        CacheSwitch::default(),
    )
    .expect("build cache");
    (store, cache)
}

fn bench_select_hit(c: &mut Criterion) {
    let (store, cache) = bench_cache(1_000, CacheConfig::default());
    let session = Session::new(ConnectionId::now_v7());
    let global = ScopeKey::global();
    let by_sku = Arc::new(BySku(Arc::clone(&store)));
    for id in 1..=1_000 {
        cache
            .select_by_id(&session, &global, id, true)
            .expect("warm cache");
    }

    c.bench_function("select/by_id_hit", |b| {
        let mut id = 0;
        b.iter(|| {
            id = id % 1_000 + 1;
            let found = cache
                .select_by_id(&session, &global, black_box(id), true)
                .expect("select");
            black_box(found);
        });
    });

    c.bench_function("select/secondary_hit", |b| {
        let key = "sku-00500".to_string();
        b.iter(|| {
            let found = cache
                .select(&by_sku, &session, &global, black_box(&key), true)
                .expect("select");
            black_box(found);
        });
    });
}

fn bench_expire(c: &mut Criterion) {
    let (store, cache) = bench_cache(1_000, CacheConfig::default());
    let session = Session::new(ConnectionId::now_v7());
    let global = ScopeKey::global();
    cache
        .select_all_in_context(&session, &global)
        .expect("load list");

    c.bench_function("expire/ten_changed_rows", |b| {
        b.iter(|| {
            for id in 1..=10 {
                if let Ok(Some(item)) = store.row(id) {
                    store.save(item).expect("save");
                }
            }
            let outcome = cache.expire(Some(&session), 0).expect("expire");
            black_box(outcome);
        });
    });
}

fn bench_shrink(c: &mut Criterion) {
    let config = CacheConfig::default()
        .with_max_size(256)
        .with_strategy(EvictionStrategy::Lru)
        .with_keep_quota(50);
    let (_store, cache) = bench_cache(1_000, config);
    let session = Session::new(ConnectionId::now_v7());
    let global = ScopeKey::global();

    c.bench_function("shrink/lru_churn", |b| {
        let mut id = 0;
        b.iter(|| {
            id = id % 1_000 + 1;
            let found = cache
                .select_by_id(&session, &global, black_box(id), true)
                .expect("select");
            black_box(found);
        });
    });
}

criterion_group!(benches, bench_select_hit, bench_expire, bench_shrink);
criterion_main!(benches);
