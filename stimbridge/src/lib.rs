/*!
Runtime of the stimulation bridge.

Two execution contexts share one [`shared::ProtocolState`]:

- the [`acquisition`] loop, paced by the input sample clock, turning each
  acquired buffer into a data frame for the [`transport`];
- the [`control`] loop, applying inbound control commands one at a time
  through the [`applicator`] and publishing the resulting state.

[`protocol::ProtocolCore`] owns the state and wires both loops to the
hardware seams in [`hardware`] and to a [`transport::Transport`].
*/

pub mod acquisition;
pub mod applicator;
pub mod config;
pub mod control;
pub mod hardware;
pub mod protocol;
pub mod simulated;
pub mod transport;
