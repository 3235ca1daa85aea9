use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

macro_rules! sequential_id {
    ($name:ident, $generator:ident, $prefix:literal) => {
        #[derive(Clone,Copy,Debug,PartialEq,Eq,Hash,PartialOrd,Ord,serde::Serialize,serde::Deserialize)]
        pub struct $name(i64);

        impl $name
        {
            pub fn new(value: i64) -> Self { Self(value) }
            pub fn value(&self) -> i64 { self.0 }
        }

        impl fmt::Display for $name
        {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
            {
                write!(f, concat!($prefix, "_{:03}"), self.0)
            }
        }

        /// Hands out sequential identifiers; safe to share between threads.
        #[derive(Debug)]
        pub struct $generator(AtomicI64);

        impl $generator
        {
            pub const fn new(start: i64) -> Self { Self(AtomicI64::new(start)) }

            pub fn next(&self) -> $name
            {
                $name(self.0.fetch_add(1, Ordering::Relaxed))
            }
        }

        impl Default for $generator
        {
            fn default() -> Self { Self::new(0) }
        }
    };
}

sequential_id!(ListenerId, ListenerIdGenerator, "Server");
sequential_id!(HandlerId, HandlerIdGenerator, "ClientSession");
