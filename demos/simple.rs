use std::fmt;

use buddy_cache_pool::{Cache, FromKey, KeyProvider, PoolAllocator};

#[derive(Debug)]
struct Greeting {
    name: String,
}

impl KeyProvider<String> for Greeting {
    fn matches(&self, key: &String) -> bool {
        &self.name == key
    }
}

impl FromKey<String> for Greeting {
    fn from_key(key: &String) -> Self {
        Greeting { name: key.clone() }
    }
}

impl fmt::Display for Greeting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hello, {}!", self.name)
    }
}

fn main() {
    env_logger::init();

    let pool = PoolAllocator::new(4, 12);
    let mut cache = Cache::<String, _>::new(2, pool);

    cache.get::<Greeting>(&"alice".to_string()).unwrap();
    cache.get::<Greeting>(&"bob".to_string()).unwrap();
    cache.get::<Greeting>(&"alice".to_string()).unwrap();

    let mut out = String::new();
    cache.print(&mut out).unwrap();
    println!("{out}");
}
