use super::ControlChannel;
use crate::session::Role;
use log::{debug, info};
use std::io;
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;

/// Cloneable handle that shuts the session socket down, unblocking any read
/// or write in progress on either side of the channel.
#[derive(Clone, Debug)]
pub struct ChannelInterrupt {
    stream: Arc<TcpStream>,
}

impl ChannelInterrupt {
    fn from_stream(stream: &TcpStream) -> io::Result<Self> {
        stream.try_clone().map(|stream| Self {
            stream: Arc::new(stream),
        })
    }

    pub fn fire(&self) {
        match self.stream.peer_addr() {
            Ok(addr) => info!("event=colo_channel_interrupt peer={addr}"),
            Err(_) => debug!("event=colo_channel_interrupt peer=unknown"),
        }
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            debug!("event=colo_channel_interrupt_error error={err}");
        }
    }
}

fn channel_from_stream(role: Role, stream: TcpStream) -> io::Result<ControlChannel> {
    stream.set_nodelay(true)?;
    let interrupt = ChannelInterrupt::from_stream(&stream)?;
    let writer = stream.try_clone()?;
    Ok(ControlChannel::new(role, stream, writer).with_interrupt(interrupt))
}

/// Opens the primary's side of a session by connecting to the secondary.
pub fn connect_session(target: impl ToSocketAddrs) -> io::Result<ControlChannel> {
    let mut last_err = None;
    for addr in target.to_socket_addrs()? {
        debug!("event=colo_tcp_attempt peer={addr}");
        match TcpStream::connect(addr) {
            Ok(stream) => {
                info!("event=colo_tcp_connected peer={addr} role=primary");
                return channel_from_stream(Role::Primary, stream);
            }
            Err(err) => {
                debug!("event=colo_tcp_error peer={} error={}", addr, err);
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::other("unable to connect to secondary")))
}

/// Accepts the primary's connection and opens the secondary's side of a session.
pub fn accept_session(listener: &TcpListener) -> io::Result<ControlChannel> {
    let (stream, addr) = listener.accept()?;
    info!("event=colo_tcp_accept peer={addr} role=secondary");
    channel_from_stream(Role::Secondary, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CheckpointMessage;
    use std::thread;

    #[test]
    fn loopback_session_carries_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let secondary = thread::spawn(move || {
            let mut channel = accept_session(&listener).unwrap();
            channel.send(CheckpointMessage::Ready).unwrap();
            channel.recv_expect(CheckpointMessage::New).unwrap();
        });
        let mut primary = connect_session(addr).unwrap();
        primary.recv_expect(CheckpointMessage::Ready).unwrap();
        primary.send(CheckpointMessage::New).unwrap();
        secondary.join().unwrap();
    }

    #[test]
    fn interrupt_unblocks_pending_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(std::time::Duration::from_millis(200));
            drop(stream);
        });
        let mut channel = connect_session(addr).unwrap();
        let interrupt = channel.interrupt_handle().unwrap();
        let firing = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            interrupt.fire();
        });
        assert!(channel.recv_any().unwrap_err().is_transport());
        firing.join().unwrap();
        peer.join().unwrap();
    }
}
