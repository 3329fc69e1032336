// Integration suites run against the in-process broker; `live` needs a real RabbitMQ.

mod common;
mod connection_test;
mod publisher_test;
