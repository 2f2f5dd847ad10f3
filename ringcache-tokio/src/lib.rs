//! A concrete [`ringcache_core::node::Transport`] over
//! `tokio::net::TcpStream`, with keep-alive configured through `socket2`.

use async_trait::async_trait;
use ringcache_core::endpoint::Endpoint;
use ringcache_core::error::Error;
use ringcache_core::node::Transport;
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// A TCP connection to one cache node, driven by the core actor loop.
#[derive(Debug)]
pub struct TokioTransport {
    stream: TcpStream,
}

#[async_trait]
impl Transport for TokioTransport {
    async fn connect(
        endpoint: &Endpoint,
        timeout: Duration,
        keepalive: bool,
        keepalive_delay: Duration,
    ) -> Result<Self, Error> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint.id()))
            .await
            .map_err(|_| Error::ConnectionTimeout)??;

        if keepalive {
            let sock_ref = SockRef::from(&stream);
            let conf = TcpKeepalive::new().with_time(keepalive_delay).with_interval(keepalive_delay);
            sock_ref.set_tcp_keepalive(&conf)?;
        }

        Ok(TokioTransport { stream })
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        Ok(self.stream.read(buf).await?)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        Ok(self.stream.write_all(data).await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ringcache_core::cluster::{Cluster, ClusterConfig};
    use std::io::{BufRead, BufReader};
    use std::process::{Child, Command, Stdio};

    #[derive(Debug)]
    struct MemcachedTester {
        names: Vec<String>,
        procs: Vec<Child>,
    }

    impl MemcachedTester {
        fn new(port: usize) -> Self {
            let name = String::from("test_memcached");
            let proc = MemcachedTester::new_proc(&name, port);
            Self {
                procs: vec![proc],
                names: vec![name],
            }
        }

        fn new_cluster(ports: Vec<usize>) -> Self {
            let (names, procs) = ports
                .into_iter()
                .enumerate()
                .map(|(i, port)| {
                    let name = format!("test_memcached_{}", i);
                    let proc = MemcachedTester::new_proc(&name, port);
                    (name, proc)
                })
                .unzip();
            Self { procs, names }
        }

        fn new_proc(name: &str, port: usize) -> Child {
            let mut proc = Command::new("docker")
                .args(&[
                    "run",
                    "--rm",
                    "-t",
                    "--name",
                    name,
                    "-p",
                    &format!("{}:11211", port),
                    "memcached",
                    "memcached",
                    "-vv",
                ])
                .stdout(Stdio::piped())
                .spawn()
                .unwrap();

            let stdout = proc.stdout.as_mut().unwrap();
            let mut reader = BufReader::new(stdout);
            let mut buf = String::new();
            reader.read_line(&mut buf).unwrap();

            proc
        }
    }

    impl Drop for MemcachedTester {
        fn drop(&mut self) {
            for name in self.names.iter() {
                Command::new("docker").args(&["stop", name]).output().unwrap();
            }
            for proc in self.procs.iter_mut() {
                proc.wait().unwrap();
            }
        }
    }

    #[tokio::test]
    async fn connects_to_a_live_node() {
        let _tester = MemcachedTester::new(11211);
        TokioTransport::connect(
            &Endpoint::new("127.0.0.1", 11211),
            Duration::from_millis(5000),
            true,
            Duration::from_millis(1000),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn end_to_end_single_node() {
        let _tester = MemcachedTester::new(11211);
        let cluster: Cluster<TokioTransport> =
            Cluster::new(&["127.0.0.1:11211"], ClusterConfig::default()).unwrap();
        cluster.connect().await.unwrap();

        assert_eq!(cluster.get(b"key").await.unwrap(), None);
        cluster.set(b"key", b"hello", 0, 0).await.unwrap();
        assert_eq!(cluster.get(b"key").await.unwrap(), Some(b"hello".to_vec()));

        cluster.set(b"key", b"world", 0, 0).await.unwrap();
        assert_eq!(cluster.get(b"key").await.unwrap(), Some(b"world".to_vec()));

        assert!(cluster.delete(b"key").await.unwrap());
        assert_eq!(cluster.get(b"key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn end_to_end_cluster_distribution() {
        let _tester = MemcachedTester::new_cluster(vec![11211, 11212, 11213]);
        let cluster: Cluster<TokioTransport> = Cluster::new(
            &["127.0.0.1:11211", "127.0.0.1:11212", "127.0.0.1:11213"],
            ClusterConfig::default(),
        )
        .unwrap();
        cluster.connect().await.unwrap();

        cluster.set(b"abc", b"123", 0, 0).await.unwrap();
        cluster.set(b"def", b"456", 0, 0).await.unwrap();

        let result = cluster.gets(&[b"abc", b"def", b"qwop"]).await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0, b"abc");
        assert_eq!(result[0].1.data, b"123");
        assert_eq!(result[1].0, b"def");
        assert_eq!(result[1].1.data, b"456");
    }
}
