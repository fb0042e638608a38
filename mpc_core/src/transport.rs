use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    FutureExt, Sink, SinkExt, Stream, StreamExt, TryFutureExt,
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_serde::formats::Bincode;
use tokio_util::codec::LengthDelimitedCodec;

/// Error type for channels.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Error while sending message to {0}")]
    Send(usize),
    #[error("Error while receiving message from {0}")]
    Recv(usize),
    #[error("No channel to party {0}")]
    NoChannel(usize),
    #[error("Could not encode message: {0}")]
    Encode(String),
}

/// Point-to-point byte transport between the parties of a session.
/// Delivery is assumed reliable and ordered on each channel.
#[async_trait(?Send)]
pub trait Network {
    /// Number of parties participating in multi-party protocol.
    fn num_parties(&self) -> usize;

    /// ID of current party.
    fn party_id(&self) -> usize;

    /// Send message to party with given ID.
    async fn send_to(&mut self, party: usize, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Send the same message to all other parties.
    async fn broadcast_to_all(&mut self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Receive message from party with given ID.
    async fn receive_from(&mut self, party: usize) -> Result<Vec<u8>, TransportError>;

    /// Receive one message from every other party.
    async fn receive_from_all(&mut self) -> Result<Vec<(usize, Vec<u8>)>, TransportError>;

    /// Send given messages, then receive one message from every other party.
    async fn exchange(
        &mut self,
        outgoing: Vec<(usize, Vec<u8>)>,
    ) -> Result<Vec<(usize, Vec<u8>)>, TransportError> {
        for (party, bytes) in outgoing {
            self.send_to(party, bytes).await?;
        }
        self.receive_from_all().await
    }
}

/// Wrapper for peer-to-peer connections in multi-party protocol.
pub struct MultipartyTransport<T, Channel> {
    channels: Vec<Option<(SplitSink<Channel, T>, SplitStream<Channel>)>>,
    party_id: usize,
}

impl<T, Channel> MultipartyTransport<T, Channel>
where
    Channel: Stream + Sink<T>,
{
    /// Create wrapper for given list of connections. All channels but party_id should be present.
    pub fn new(
        channels: impl IntoIterator<Item = Option<Channel>>,
        party_id: usize,
    ) -> Result<Self, TransportError> {
        // We split streams into unidirectional halves. This allows us to
        // asynchronously wait on both receives and sends without bothering borrow checker.
        let channels: Vec<_> = channels.into_iter().map(|x| x.map(|x| x.split())).collect();
        for (j, channel) in channels.iter().enumerate() {
            if j != party_id && channel.is_none() {
                return Err(TransportError::NoChannel(j));
            }
        }
        Ok(Self { channels, party_id })
    }
}

impl<T, Channel> MultipartyTransport<T, Channel> {
    /// Number of parties participating in multi-party protocol.
    pub fn num_parties(&self) -> usize {
        self.channels.len()
    }

    /// ID of current party.
    pub fn party_id(&self) -> usize {
        self.party_id
    }

    /// Halves of channel to other party.
    fn channel(
        &mut self,
        other_id: usize,
    ) -> Result<&mut (SplitSink<Channel, T>, SplitStream<Channel>), TransportError> {
        if other_id == self.party_id {
            return Err(TransportError::NoChannel(other_id));
        }
        self.channels
            .get_mut(other_id)
            .and_then(Option::as_mut)
            .ok_or(TransportError::NoChannel(other_id))
    }
}

impl<T, E, Channel> MultipartyTransport<T, Channel>
where
    T: Clone,
    Channel: Stream<Item = Result<T, E>> + Sink<T> + Unpin,
{
    /// Send message to party with given ID.
    pub async fn send_message(&mut self, other_id: usize, msg: T) -> Result<(), TransportError> {
        let (sink, _) = self.channel(other_id)?;
        sink.send(msg)
            .await
            .map_err(|_| TransportError::Send(other_id))
    }

    /// Receive message from party with given ID.
    pub async fn receive_message(&mut self, other_id: usize) -> Result<T, TransportError> {
        let (_, stream) = self.channel(other_id)?;
        match stream.next().await {
            Some(Ok(msg)) => Ok(msg),
            _ => Err(TransportError::Recv(other_id)),
        }
    }

    /// Send message to all parties.
    pub async fn send_to_all(&mut self, msg: T) -> Result<(), TransportError> {
        let party_id = self.party_id;
        futures::future::try_join_all(
            self.channels
                .iter_mut()
                .enumerate()
                .filter(|(id, _)| *id != party_id)
                .filter_map(|(id, channel)| channel.as_mut().map(|channel| (id, channel)))
                .map(|(id, (sink, _))| {
                    sink.send(msg.clone())
                        .then(move |x| async move { x.map_err(|_| TransportError::Send(id)) })
                }),
        )
        .await
        .map(|_| ())
    }

    /// Receive messages from all parties.
    pub async fn receive_from_all_parties(&mut self) -> Result<Vec<(usize, T)>, TransportError> {
        let party_id = self.party_id;
        futures::future::try_join_all(
            self.channels
                .iter_mut()
                .enumerate()
                .filter(|(id, _)| *id != party_id)
                .filter_map(|(id, channel)| channel.as_mut().map(|channel| (id, channel)))
                .map(|(id, (_, stream))| {
                    stream.next().then(move |raw| async move {
                        match raw {
                            Some(Ok(msg)) => Ok((id, msg)),
                            _ => Err(TransportError::Recv(id)),
                        }
                    })
                }),
        )
        .await
    }

    /// Concurrently send individual messages to and receive messages from all parties.
    /// `outgoing` is indexed by party ID; parties with `None` are only received from.
    pub async fn exchange_with_all(
        &mut self,
        outgoing: Vec<Option<T>>,
    ) -> Result<Vec<(usize, T)>, TransportError> {
        let party_id = self.party_id;
        futures::future::try_join_all(
            self.channels
                .iter_mut()
                .zip(outgoing.into_iter().chain(std::iter::repeat(None)))
                .enumerate()
                .filter(|(id, _)| *id != party_id)
                .filter_map(|(id, (channel, msg))| {
                    channel.as_mut().map(|channel| (id, channel, msg))
                })
                .map(|(id, (sink, stream), msg)| {
                    let send_future = async move {
                        match msg {
                            Some(msg) => sink.send(msg).await.map_err(|_| TransportError::Send(id)),
                            None => Ok(()),
                        }
                    };
                    let recv_future = stream.next().then(move |raw| async move {
                        match raw {
                            Some(Ok(msg)) => Ok((id, msg)),
                            _ => Err(TransportError::Recv(id)),
                        }
                    });
                    futures::future::try_join(send_future, recv_future)
                        .map_ok(|(_, received_msg)| received_msg)
                }),
        )
        .await
    }
}

#[async_trait(?Send)]
impl<E, Channel> Network for MultipartyTransport<Vec<u8>, Channel>
where
    Channel: Stream<Item = Result<Vec<u8>, E>> + Sink<Vec<u8>> + Unpin,
{
    fn num_parties(&self) -> usize {
        MultipartyTransport::num_parties(self)
    }

    fn party_id(&self) -> usize {
        MultipartyTransport::party_id(self)
    }

    async fn send_to(&mut self, party: usize, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.send_message(party, bytes).await
    }

    async fn broadcast_to_all(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.send_to_all(bytes).await
    }

    async fn receive_from(&mut self, party: usize) -> Result<Vec<u8>, TransportError> {
        self.receive_message(party).await
    }

    async fn receive_from_all(&mut self) -> Result<Vec<(usize, Vec<u8>)>, TransportError> {
        self.receive_from_all_parties().await
    }

    async fn exchange(
        &mut self,
        outgoing: Vec<(usize, Vec<u8>)>,
    ) -> Result<Vec<(usize, Vec<u8>)>, TransportError> {
        let mut by_party: Vec<Option<Vec<u8>>> = vec![None; self.channels.len()];
        for (party, bytes) in outgoing {
            match by_party.get_mut(party) {
                Some(slot) if party != self.party_id => *slot = Some(bytes),
                _ => return Err(TransportError::NoChannel(party)),
            }
        }
        self.exchange_with_all(by_party).await
    }
}

/// Length-framed Bincode-encoded messages channel.
pub type BincodeStreamSink<T, C> =
    tokio_serde::Framed<tokio_util::codec::Framed<C, LengthDelimitedCodec>, T, T, Bincode<T, T>>;

/// Length-framed Bincode-encoded tokio's Duplex stream.
pub type BincodeDuplex<T> = BincodeStreamSink<T, DuplexStream>;

/// In-process transport carrying raw bytes.
pub type LocalTransport = MultipartyTransport<Vec<u8>, BincodeDuplex<Vec<u8>>>;

/// Create length-framed Bincode-encoded message channel from AsyncRead/Write.
pub fn wrap_bincode<T, C>(channel: C) -> BincodeStreamSink<T, C>
where
    C: AsyncRead + AsyncWrite,
{
    let length_delimited = tokio_util::codec::Framed::new(channel, LengthDelimitedCodec::new());
    tokio_serde::Framed::new(length_delimited, Bincode::default())
}

/// Create bidirectional Bincode-encoded channel.
pub fn bincode_duplex<T>(max_buf_size: usize) -> (BincodeDuplex<T>, BincodeDuplex<T>) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (wrap_bincode(a), wrap_bincode(b))
}

/// Create in-process channels for testing multiparty protocols.
pub fn mock_multiparty_channels<T>(
    num_parties: usize,
    max_buf_size: usize,
) -> Vec<MultipartyTransport<T, BincodeDuplex<T>>>
where
    T: Clone + Serialize + DeserializeOwned + Unpin,
{
    let mut matrix: Vec<Vec<_>> = (0..num_parties)
        .map(|_| (0..num_parties).map(|_| None).collect())
        .collect();

    for i in 0..num_parties {
        for j in 0..i {
            let (a, b) = bincode_duplex::<T>(max_buf_size);
            matrix[i][j] = Some(a);
            matrix[j][i] = Some(b);
        }
    }

    matrix
        .into_iter()
        .enumerate()
        .filter_map(|(id, row)| MultipartyTransport::new(row, id).ok())
        .collect()
}
