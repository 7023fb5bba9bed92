//! # Serial (COM) Port Driver
//!
//! A 16550-compatible UART used as the primary debug sink. Detection probes
//! the scratch register with all 256 byte values — absent hardware fails the
//! read-back and the port reports not-found. Initialization programs the
//! divisor for the requested baud rate, 8N1 framing, DTR/RTS/OUT2 and the
//! FIFO.
//!
//! The driver watches the modem status register: a toggling ring-indicator
//! bit flips the port into modem-control mode, after which transmission
//! honors CD/CTS/DSR and reception discards bytes while carrier is down.

use kernel_ports::PortSpace;
use kernel_status::Status;

/// UART input clock ticks per second / 16 (115200).
pub const CLOCK_RATE: u32 = 0x1C200;

/// Upper bound on transmit-ready polling iterations.
pub const WAIT_TIMEOUT: u32 = 204_800;

/// Register offsets from the port base.
const REG_RBR: u16 = 0x00; // receive buffer
const REG_THR: u16 = 0x00; // transmit holding
const REG_IER: u16 = 0x01; // interrupt enable
const REG_FCR: u16 = 0x02; // FIFO control
const REG_LCR: u16 = 0x03; // line control
const REG_MCR: u16 = 0x04; // modem control
const REG_LSR: u16 = 0x05; // line status
const REG_MSR: u16 = 0x06; // modem status
const REG_SR: u16 = 0x07; // scratch
const DIV_DLL: u16 = 0x00; // divisor latch, low
const DIV_DLM: u16 = 0x01; // divisor latch, high

/// Line-status bits.
const LSR_DR: u8 = 0x01;
const LSR_OE: u8 = 0x02;
const LSR_PE: u8 = 0x04;
const LSR_FE: u8 = 0x08;
const LSR_THRE: u8 = 0x20;

/// Modem-status bits.
const MSR_RI: u8 = 0x40;
const MSR_DCD: u8 = 0x80;
const MSR_DSR_CTS_CD: u8 = 0xB0;

/// Line-control values.
const LCR_DISABLE: u8 = 0x00;
const LCR_DLAB: u8 = 0x80;
const LCR_8N1: u8 = 0x03;

/// Modem-control values.
const MCR_DTR_RTS_OUT2: u8 = 0x0B;
const MCR_NORMAL_OPERATION: u8 = 0x0F;

/// FIFO-control values.
const FCR_ENABLE_AND_RESET: u8 = 0x07;

/// Port state flags.
const FLAG_INIT: u16 = 0x01;
const FLAG_DEFAULT_BAUD: u16 = 0x02;
const FLAG_MODEM_CONTROL: u16 = 0x04;

/// An initialized (or not-yet-initialized) COM port.
#[derive(Debug)]
pub struct ComPort {
    address: u16,
    baud: u32,
    flags: u16,
    ring_flag: u8,
}

impl ComPort {
    /// An empty descriptor; fill it with [`ComPort::initialize`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            address: 0,
            baud: 0,
            flags: 0,
            ring_flag: 0,
        }
    }

    /// Base I/O address, zero while uninitialized.
    #[must_use]
    pub const fn address(&self) -> u16 {
        self.address
    }

    /// Programmed baud rate.
    #[must_use]
    pub const fn baud(&self) -> u32 {
        self.baud
    }

    /// Whether initialization completed.
    #[must_use]
    pub const fn initialized(&self) -> bool {
        self.flags & FLAG_INIT != 0
    }

    /// Probes and initializes the UART at `address`.
    ///
    /// A zero `baud` selects the default rate (and records that it was
    /// defaulted). Re-initializing the same port at the same rate is a
    /// no-op.
    ///
    /// # Errors
    /// [`Status::NotFound`] when the scratch-register probe fails (no UART
    /// decodes the address).
    pub fn initialize<P: PortSpace>(
        &mut self,
        ports: &mut P,
        address: u16,
        baud: u32,
    ) -> Result<(), Status> {
        let mut flags: u16 = 0;
        let mut baud = baud;
        if baud == 0 {
            baud = CLOCK_RATE;
            flags |= FLAG_DEFAULT_BAUD;
        }

        if self.address == address && self.baud == baud {
            return Ok(());
        }

        // Scratch-register probe: the latch must echo all 256 values.
        for value in 0..=255u8 {
            ports.write(address + REG_SR, value);
            if ports.read(address + REG_SR) != value {
                return Err(Status::NotFound);
            }
        }

        // Quiesce the line and interrupts.
        ports.write(address + REG_LCR, LCR_DISABLE);
        ports.write(address + REG_IER, LCR_DISABLE);

        // Program the divisor through the latch.
        ports.write(address + REG_LCR, LCR_DLAB);
        let divisor = CLOCK_RATE / baud;
        #[allow(clippy::cast_possible_truncation)]
        {
            ports.write(address + DIV_DLL, (divisor & 0xFF) as u8);
            ports.write(address + DIV_DLM, ((divisor >> 8) & 0xFF) as u8);
        }

        // 8 data bits, 1 stop bit, no parity.
        ports.write(address + REG_LCR, LCR_8N1);

        // Raise DTR/RTS/OUT2, enable the FIFO with both sides reset.
        ports.write(address + REG_MCR, MCR_DTR_RTS_OUT2);
        ports.write(address + REG_FCR, FCR_ENABLE_AND_RESET);

        flags |= FLAG_INIT;

        // Normal operation mode, then drain any junk byte.
        ports.write(address + REG_MCR, MCR_NORMAL_OPERATION);
        let _ = ports.read(address + REG_RBR);

        self.address = address;
        self.baud = baud;
        self.flags = flags;
        self.ring_flag = 0;
        Ok(())
    }

    /// Reads the line status register, watching the ring indicator.
    ///
    /// When the expected bits are absent, the modem status is sampled; a
    /// ring indicator seen both asserted and deasserted flips the port into
    /// modem-control mode.
    fn read_lsr<P: PortSpace>(&mut self, ports: &mut P, expected: u8) -> u8 {
        let lsr = ports.read(self.address + REG_LSR);
        if lsr & expected == 0 {
            let msr = ports.read(self.address + REG_MSR);
            self.ring_flag |= if msr & MSR_RI != 0 { 1 } else { 2 };
            if self.ring_flag == 3 {
                self.flags |= FLAG_MODEM_CONTROL;
            }
        }
        lsr
    }

    /// Transmits one byte, bounded by the poll timeout.
    ///
    /// # Errors
    /// [`Status::DeviceNotReady`] when the port was never initialized, and
    /// [`Status::IoDeviceError`] when the transmitter never went ready
    /// within the poll bound.
    pub fn put_byte<P: PortSpace>(&mut self, ports: &mut P, byte: u8) -> Result<(), Status> {
        if self.address == 0 {
            return Err(Status::DeviceNotReady);
        }

        // In modem-control mode, wait for DSR+CTS+CD and eat any byte that
        // arrives while carrier is down.
        while self.flags & FLAG_MODEM_CONTROL != 0 {
            let msr = ports.read(self.address + REG_MSR) & MSR_DSR_CTS_CD;
            if msr == MSR_DSR_CTS_CD {
                break;
            }
            let lsr = self.read_lsr(ports, 0);
            if msr & MSR_DCD == 0 && lsr & LSR_DR == LSR_DR {
                let _ = ports.read(self.address + REG_RBR);
            }
        }

        // Bounded wait for transmitter-holding-register empty.
        let mut timeout = WAIT_TIMEOUT;
        while self.read_lsr(ports, LSR_THRE) & LSR_THRE == 0 {
            timeout -= 1;
            if timeout == 0 {
                return Err(Status::IoDeviceError);
            }
        }

        ports.write(self.address + REG_THR, byte);
        Ok(())
    }

    /// Receives one byte.
    ///
    /// With `wait`, polls up to the timeout bound; otherwise a single
    /// sample. `poll_only` checks for data without consuming it.
    ///
    /// # Errors
    /// [`Status::DeviceNotReady`] before initialization,
    /// [`Status::IoDeviceError`] on framing/parity/overrun, and
    /// [`Status::NotFound`] when no data arrived.
    pub fn get_byte<P: PortSpace>(
        &mut self,
        ports: &mut P,
        wait: bool,
        poll_only: bool,
    ) -> Result<u8, Status> {
        if self.address == 0 {
            return Err(Status::DeviceNotReady);
        }

        let mut retries = if wait { WAIT_TIMEOUT } else { 1 };
        while retries > 0 {
            retries -= 1;

            let lsr = self.read_lsr(ports, LSR_DR);
            if lsr & LSR_DR == LSR_DR {
                if lsr & (LSR_FE | LSR_OE | LSR_PE) != 0 {
                    return Err(Status::IoDeviceError);
                }
                if poll_only {
                    return Ok(0);
                }

                let byte = ports.read(self.address + REG_RBR);
                if self.flags & FLAG_MODEM_CONTROL != 0 {
                    // No carrier: the byte is line noise.
                    if ports.read(self.address + REG_MSR) & MSR_DCD == 0 {
                        continue;
                    }
                }
                return Ok(byte);
            }
        }

        // Reset the LSR sampling state before reporting no data.
        let _ = self.read_lsr(ports, 0);
        Err(Status::NotFound)
    }
}

impl Default for ComPort {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A simulated 16550 with a latching scratch register.
    struct Fake16550 {
        present: bool,
        scratch: u8,
        lsr: u8,
        msr: u8,
        rx: Option<u8>,
        tx: Vec<u8>,
        register_log: Vec<(u16, u8)>,
    }

    impl Fake16550 {
        fn present() -> Self {
            Self {
                present: true,
                scratch: 0,
                lsr: LSR_THRE,
                msr: 0,
                rx: None,
                tx: Vec::new(),
                register_log: Vec::new(),
            }
        }

        fn absent() -> Self {
            Self {
                present: false,
                ..Self::present()
            }
        }
    }

    impl PortSpace for Fake16550 {
        fn read(&mut self, port: u16) -> u8 {
            let offset = port & 0x7;
            match offset {
                REG_SR if self.present => self.scratch,
                REG_LSR => {
                    let mut lsr = self.lsr;
                    if self.rx.is_some() {
                        lsr |= LSR_DR;
                    }
                    lsr
                }
                REG_MSR => self.msr,
                REG_RBR => self.rx.take().unwrap_or(0),
                _ => 0,
            }
        }

        fn write(&mut self, port: u16, value: u8) {
            let offset = port & 0x7;
            self.register_log.push((offset, value));
            if offset == REG_SR && self.present {
                self.scratch = value;
            } else if offset == REG_THR {
                self.tx.push(value);
            }
        }
    }

    #[test]
    fn detection_and_initialization() {
        let mut uart = Fake16550::present();
        let mut port = ComPort::new();
        port.initialize(&mut uart, 0x3F8, 115_200).expect("found");

        assert_eq!(port.address(), 0x3F8);
        assert_eq!(port.baud(), 115_200);
        assert!(port.initialized());

        // Divisor for 115200 is 1: DLL=1, DLM=0 behind the DLAB.
        let dlab_at = uart
            .register_log
            .iter()
            .position(|&(r, v)| r == REG_LCR && v == LCR_DLAB)
            .expect("DLAB enabled");
        assert_eq!(uart.register_log[dlab_at + 1], (DIV_DLL, 1));
        assert_eq!(uart.register_log[dlab_at + 2], (DIV_DLM, 0));

        // 8N1 framing and the FIFO reset made it out.
        assert!(uart.register_log.contains(&(REG_LCR, LCR_8N1)));
        assert!(uart.register_log.contains(&(REG_FCR, FCR_ENABLE_AND_RESET)));
    }

    #[test]
    fn absent_port_fails_the_scratch_probe() {
        let mut uart = Fake16550::absent();
        let mut port = ComPort::new();
        assert_eq!(
            port.initialize(&mut uart, 0x3F8, 115_200),
            Err(Status::NotFound)
        );
        assert!(!port.initialized());
    }

    #[test]
    fn transmit_waits_for_thre() {
        let mut uart = Fake16550::present();
        let mut port = ComPort::new();
        port.initialize(&mut uart, 0x3F8, 115_200).expect("found");

        port.put_byte(&mut uart, 0x41).expect("sent");
        assert_eq!(uart.tx, vec![0x41]);

        // A stuck transmitter hits the poll bound.
        uart.lsr = 0;
        assert_eq!(port.put_byte(&mut uart, 0x42), Err(Status::IoDeviceError));
    }

    #[test]
    fn uninitialized_port_reports_not_ready() {
        let mut uart = Fake16550::present();
        let mut port = ComPort::new();
        assert_eq!(port.put_byte(&mut uart, 0x41), Err(Status::DeviceNotReady));
        assert_eq!(
            port.get_byte(&mut uart, false, false).unwrap_err(),
            Status::DeviceNotReady
        );
    }

    #[test]
    fn receive_paths() {
        let mut uart = Fake16550::present();
        let mut port = ComPort::new();
        port.initialize(&mut uart, 0x3F8, 115_200).expect("found");

        assert_eq!(
            port.get_byte(&mut uart, false, false).unwrap_err(),
            Status::NotFound
        );

        uart.rx = Some(0x55);
        assert_eq!(port.get_byte(&mut uart, false, false), Ok(0x55));

        // Parity errors surface as device errors.
        uart.rx = Some(0x00);
        uart.lsr |= LSR_PE;
        assert_eq!(
            port.get_byte(&mut uart, false, false).unwrap_err(),
            Status::IoDeviceError
        );
    }

    #[test]
    fn ring_indicator_toggle_enables_modem_control() {
        let mut uart = Fake16550::present();
        let mut port = ComPort::new();
        port.initialize(&mut uart, 0x3F8, 115_200).expect("found");

        // RI asserted on one idle sample, deasserted on the next.
        uart.msr = MSR_RI;
        let _ = port.get_byte(&mut uart, false, false);
        uart.msr = 0;
        let _ = port.get_byte(&mut uart, false, false);
        assert!(port.flags & FLAG_MODEM_CONTROL != 0);

        // Transmission now insists on DSR+CTS+CD.
        uart.msr = MSR_DSR_CTS_CD;
        port.put_byte(&mut uart, 0x43).expect("sent with carrier");
        assert!(uart.tx.contains(&0x43));
    }
}
