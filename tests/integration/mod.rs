mod consumer_test;
mod stream_test;
mod subscription_test;
